use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ClauseError;
use crate::instance::ContainerSpec;

/// Observed container state as reported by the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectState {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Engine status word (`running`, `exited`, `created`, ...).
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine itself cannot be reached (daemon down, binary missing).
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    #[error("no such container: {0}")]
    NotFound(String),

    /// Name or port already taken.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("engine call {op} timed out after {timeout_ms}ms")]
    Timeout { op: String, timeout_ms: u64 },

    #[error("engine {op} failed: {message}")]
    Command { op: String, message: String },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Translate into the public taxonomy for the given container.
    pub fn into_clause_error(self, container: &str) -> ClauseError {
        match self {
            Self::Unavailable(message) => ClauseError::EngineUnavailable { message },
            Self::NotFound(_) => ClauseError::InstanceNotFound {
                container: container.to_owned(),
            },
            other => ClauseError::InstanceFailed {
                container: container.to_owned(),
                message: other.to_string(),
            },
        }
    }
}

/// Capability wrapper over the container engine, keyed by container id.
///
/// Implementations must be idempotent-friendly: `remove` of a missing
/// container reports [`EngineError::NotFound`] rather than a generic failure.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Cheap reachability check of the engine itself.
    async fn ping(&self) -> Result<(), EngineError>;

    async fn pull(&self, image: &str) -> Result<(), EngineError>;

    /// Create (but do not start) a container; returns the engine id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start(&self, id: &str) -> Result<(), EngineError>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), EngineError>;

    /// Force-remove. Accepts an id or a name.
    async fn remove(&self, id: &str) -> Result<(), EngineError>;

    /// Accepts an id or a name.
    async fn inspect(&self, id: &str) -> Result<InspectState, EngineError>;

    /// Resolve a container name to its id, if such a container exists.
    async fn find_by_name(&self, name: &str) -> Result<Option<String>, EngineError>;

    async fn logs(&self, id: &str, tail: usize) -> Result<String, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn unavailable_maps_to_engine_unavailable() {
        let err = EngineError::Unavailable("Cannot connect to the Docker daemon".into())
            .into_clause_error("clause-swish");
        assert_eq!(err.kind(), ErrorKind::EngineUnavailable);
        assert!(!err.is_retryable());
    }

    #[test]
    fn command_failure_names_container() {
        let err = EngineError::Command {
            op: "start".into(),
            message: "port is already allocated".into(),
        }
        .into_clause_error("clause-swish");
        assert_eq!(err.kind(), ErrorKind::InstanceFailed);
        let msg = err.to_string();
        assert!(msg.contains("clause-swish"), "got: {msg}");
        assert!(msg.contains("port is already allocated"), "got: {msg}");
    }

    #[test]
    fn not_found_is_detectable() {
        assert!(EngineError::NotFound("x".into()).is_not_found());
        assert!(!EngineError::Conflict("x".into()).is_not_found());
    }
}
