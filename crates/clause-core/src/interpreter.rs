use std::time::Duration;

use async_trait::async_trait;

use crate::instance::ConnectionInfo;
use crate::query::{QueryRequest, QueryResult};

/// Transport-level failures talking to the interpreter service.
///
/// Interpreter-reported errors (syntax, undefined procedure) are not
/// transport failures; they come back as [`QueryResult::Error`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InterpreterError {
    #[error("interpreter unreachable: {0}")]
    Unreachable(String),

    #[error("interpreter did not answer within {0:?}")]
    Timeout(Duration),

    #[error("interpreter returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected interpreter response: {0}")]
    Protocol(String),
}

impl InterpreterError {
    /// Connect failures and server-side errors may clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Timeout(_) | Self::Protocol(_) => false,
        }
    }
}

/// The interpreter service, treated as opaque: liveness plus one-shot
/// program+query execution.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Probe the liveness endpoint; returns the observed latency.
    async fn ping(&self, conn: &ConnectionInfo, timeout: Duration)
        -> Result<Duration, InterpreterError>;

    async fn run(
        &self,
        conn: &ConnectionInfo,
        request: &QueryRequest,
    ) -> Result<QueryResult, InterpreterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(InterpreterError::Unreachable("refused".into()).is_retryable());
        assert!(InterpreterError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!InterpreterError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!InterpreterError::Protocol("bad json".into()).is_retryable());
        assert!(!InterpreterError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
