use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ClauseError, ErrorKind};
use crate::ids::CorrelationId;

/// One submission to the interpreter: the full program plus the goal.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub program: String,
    pub query: String,
    pub timeout: Duration,
    pub correlation_id: CorrelationId,
    /// Upper bound on solutions requested from the interpreter.
    pub max_solutions: u32,
}

/// One set of variable bindings, variable name to rendered term.
pub type Bindings = BTreeMap<String, String>;

/// Outcome of one query execution. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryResult {
    /// Binding sets in the interpreter's own answer order.
    Bindings {
        solutions: Vec<Bindings>,
        #[serde(default)]
        truncated: bool,
    },
    /// Ground goal proved; nothing to bind.
    Success,
    /// Deterministic "no".
    Failure,
    Error {
        kind: ErrorKind,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    TimedOut { timeout_ms: u64 },
}

impl QueryResult {
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Bindings { .. } => "bindings",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error { .. } => "error",
            Self::TimedOut { .. } => "timed_out",
        }
    }

    /// Whether the interpreter produced a definitive answer worth recording
    /// in the document history.
    pub fn is_answer(&self) -> bool {
        matches!(self, Self::Bindings { .. } | Self::Success | Self::Failure)
    }

    /// Split into an answer or a caller-facing error for `document`.
    pub fn into_answer(self, document: &str) -> Result<QueryResult, ClauseError> {
        let document = document.to_owned();
        match self {
            Self::Error { kind, message } => Err(match kind {
                ErrorKind::UndefinedProcedure => ClauseError::UndefinedProcedure { document, message },
                ErrorKind::QuerySyntaxError => ClauseError::QuerySyntaxError { document, message },
                _ => ClauseError::QueryError { document, message },
            }),
            Self::TimedOut { timeout_ms } => Err(ClauseError::QueryTimeout {
                document,
                timeout_ms,
            }),
            answer => Ok(answer),
        }
    }
}

/// Strip the interactive `?-` prefix and the terminating full stop.
///
/// Returns `None` when nothing is left to ask.
pub fn normalize_query(raw: &str) -> Option<String> {
    let mut q = raw.trim();
    if let Some(rest) = q.strip_prefix("?-") {
        q = rest.trim_start();
    }
    if let Some(rest) = q.strip_suffix('.') {
        q = rest.trim_end();
    }
    if q.is_empty() {
        None
    } else {
        Some(q.to_owned())
    }
}
