use clause_core::ClauseError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid document name: {0}")]
    InvalidName(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document already exists: {0}")]
    AlreadyExists(String),

    #[error("failed to write document {document}: {message}")]
    Write { document: String, message: String },

    #[error("failed to read document {document}: {message}")]
    Read { document: String, message: String },

    #[error("document {document} is corrupt: {message}")]
    Corrupt { document: String, message: String },
}

impl StoreError {
    pub(crate) fn write(document: &str, e: impl std::fmt::Display) -> Self {
        Self::Write {
            document: document.to_owned(),
            message: e.to_string(),
        }
    }

    pub(crate) fn read(document: &str, e: impl std::fmt::Display) -> Self {
        Self::Read {
            document: document.to_owned(),
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for ClauseError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidName(msg) | StoreError::InvalidInput(msg) => {
                ClauseError::InvalidArgument(msg)
            }
            StoreError::NotFound(name) => ClauseError::DocumentNotFound { name },
            StoreError::AlreadyExists(name) => ClauseError::DocumentAlreadyExists { name },
            StoreError::Write { document, message } => {
                ClauseError::StorageWriteFailure { document, message }
            }
            other @ (StoreError::Read { .. } | StoreError::Corrupt { .. }) => {
                ClauseError::Internal(other.to_string())
            }
        }
    }
}
