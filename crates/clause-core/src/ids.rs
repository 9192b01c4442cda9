use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Correlates one query submission across logs, the interpreter call and the
/// recorded query cell.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(format!("qry_{}", Uuid::now_v7()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Longest accepted document name.
pub const MAX_DOCUMENT_NAME_LEN: usize = 64;

/// Validate a knowledge document name.
///
/// Names double as file stems under the data root, so only
/// `[A-Za-z0-9_-]` is accepted.
pub fn validate_document_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("document name must not be empty".into());
    }
    if name.len() > MAX_DOCUMENT_NAME_LEN {
        return Err(format!(
            "document name exceeds {MAX_DOCUMENT_NAME_LEN} characters"
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(format!("document name contains invalid character {bad:?}"));
    }
    Ok(())
}
