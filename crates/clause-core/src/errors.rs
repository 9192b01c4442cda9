use serde::{Deserialize, Serialize};

/// Stable classification of every failure that can cross the public boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    EngineUnavailable,
    InstanceStartTimeout,
    InstanceNotFound,
    InstanceFailed,
    InterpreterUnavailable,
    QuerySyntaxError,
    UndefinedProcedure,
    QueryError,
    QueryTimeout,
    DocumentNotFound,
    DocumentAlreadyExists,
    StorageWriteFailure,
    InvalidArgument,
    Internal,
}

impl ErrorKind {
    /// Wire code used in RPC error objects and log fields.
    pub fn code(self) -> &'static str {
        match self {
            Self::EngineUnavailable => "ENGINE_UNAVAILABLE",
            Self::InstanceStartTimeout => "INSTANCE_START_TIMEOUT",
            Self::InstanceNotFound => "INSTANCE_NOT_FOUND",
            Self::InstanceFailed => "INSTANCE_FAILED",
            Self::InterpreterUnavailable => "INTERPRETER_UNAVAILABLE",
            Self::QuerySyntaxError => "QUERY_SYNTAX_ERROR",
            Self::UndefinedProcedure => "UNDEFINED_PROCEDURE",
            Self::QueryError => "QUERY_ERROR",
            Self::QueryTimeout => "QUERY_TIMEOUT",
            Self::DocumentNotFound => "DOCUMENT_NOT_FOUND",
            Self::DocumentAlreadyExists => "DOCUMENT_ALREADY_EXISTS",
            Self::StorageWriteFailure => "STORAGE_WRITE_FAILURE",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether a caller may reasonably retry without operator action.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::InstanceStartTimeout | Self::InterpreterUnavailable | Self::QueryTimeout
        )
    }
}

/// Typed error taxonomy for the caller-facing operations.
///
/// Every variant carries enough context (document, container, what the
/// engine or interpreter said) to act on without reading logs.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClauseError {
    #[error("container engine unavailable: {message}")]
    EngineUnavailable { message: String },

    #[error("container {container} did not become healthy after {attempts} probes{}", .last_error.as_deref().map(|e| format!(" (last error: {e})")).unwrap_or_default())]
    InstanceStartTimeout {
        container: String,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("no managed instance: {container}")]
    InstanceNotFound { container: String },

    #[error("container {container} failed: {message}")]
    InstanceFailed { container: String, message: String },

    #[error("interpreter at {url} unavailable: {message}")]
    InterpreterUnavailable { url: String, message: String },

    #[error("syntax error in document {document}: {message}")]
    QuerySyntaxError { document: String, message: String },

    #[error("undefined procedure in document {document}: {message}")]
    UndefinedProcedure { document: String, message: String },

    #[error("query against document {document} failed: {message}")]
    QueryError { document: String, message: String },

    #[error("query against document {document} timed out after {timeout_ms}ms")]
    QueryTimeout { document: String, timeout_ms: u64 },

    #[error("document not found: {name}")]
    DocumentNotFound { name: String },

    #[error("document already exists: {name}")]
    DocumentAlreadyExists { name: String },

    #[error("failed to persist document {document}: {message}")]
    StorageWriteFailure { document: String, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Internal(String),
}

impl ClauseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EngineUnavailable { .. } => ErrorKind::EngineUnavailable,
            Self::InstanceStartTimeout { .. } => ErrorKind::InstanceStartTimeout,
            Self::InstanceNotFound { .. } => ErrorKind::InstanceNotFound,
            Self::InstanceFailed { .. } => ErrorKind::InstanceFailed,
            Self::InterpreterUnavailable { .. } => ErrorKind::InterpreterUnavailable,
            Self::QuerySyntaxError { .. } => ErrorKind::QuerySyntaxError,
            Self::UndefinedProcedure { .. } => ErrorKind::UndefinedProcedure,
            Self::QueryError { .. } => ErrorKind::QueryError,
            Self::QueryTimeout { .. } => ErrorKind::QueryTimeout,
            Self::DocumentNotFound { .. } => ErrorKind::DocumentNotFound,
            Self::DocumentAlreadyExists { .. } => ErrorKind::DocumentAlreadyExists,
            Self::StorageWriteFailure { .. } => ErrorKind::StorageWriteFailure,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Structured context for RPC error payloads.
    pub fn context(&self) -> serde_json::Value {
        let mut ctx = serde_json::json!({
            "kind": self.kind(),
            "retryable": self.is_retryable(),
        });
        let extra = match self {
            Self::InstanceStartTimeout { container, attempts, last_error } => serde_json::json!({
                "container": container,
                "attempts": attempts,
                "lastError": last_error,
            }),
            Self::InstanceNotFound { container } | Self::InstanceFailed { container, .. } => {
                serde_json::json!({ "container": container })
            }
            Self::InterpreterUnavailable { url, .. } => serde_json::json!({ "url": url }),
            Self::QuerySyntaxError { document, .. }
            | Self::UndefinedProcedure { document, .. }
            | Self::QueryError { document, .. }
            | Self::StorageWriteFailure { document, .. } => {
                serde_json::json!({ "document": document })
            }
            Self::QueryTimeout { document, timeout_ms } => serde_json::json!({
                "document": document,
                "timeoutMs": timeout_ms,
            }),
            Self::DocumentNotFound { name } | Self::DocumentAlreadyExists { name } => {
                serde_json::json!({ "document": name })
            }
            _ => serde_json::Value::Null,
        };
        if let (Some(obj), serde_json::Value::Object(extra)) = (ctx.as_object_mut(), extra) {
            obj.extend(extra);
        }
        ctx
    }
}
