//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("session {0} is deleted")]
    Deleted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to lock session {session_id}: {reason}")]
    Lock { session_id: String, reason: String },

    #[error("{context}: {source}")]
    Storage {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Attach the failing step to a raw database error.
    ///
    /// Domain errors (deleted, not found, lock, validation) already say what
    /// went wrong and pass through unchanged.
    pub fn context(self, context: &'static str) -> Self {
        match self {
            MetadataError::Database(source) => MetadataError::Storage { context, source },
            other => other,
        }
    }

    /// Whether re-invoking the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetadataError::Lock { .. } | MetadataError::Storage { .. } | MetadataError::Database(_)
        )
    }
}

impl From<recall_core::Error> for MetadataError {
    fn from(e: recall_core::Error) -> Self {
        match e {
            recall_core::Error::InvalidSessionId(msg) => MetadataError::Validation(msg),
            recall_core::Error::Serialization(msg) => MetadataError::Serialization(msg),
            recall_core::Error::Config(msg) => MetadataError::Config(msg),
        }
    }
}

impl From<serde_json::Error> for MetadataError {
    fn from(e: serde_json::Error) -> Self {
        MetadataError::Serialization(e.to_string())
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
