use std::time::Duration;

/// Error type for cache operations.
///
/// A cache miss is not an error: reads return `Ok(None)` for absent keys.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The key is empty, too long or contains reserved characters.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// The backend failed to carry out the operation.
    ///
    /// `code` and `message` are the backend's own diagnostics.
    #[error("[{backend}] operation failed ({code}): {message}")]
    OperationFailed {
        backend: String,
        code: String,
        message: String,
    },

    /// A guarded write was rejected because the entry changed since it was read.
    #[error("cas conflict for key '{key}'")]
    CasConflict { key: String },

    /// A bounded wait ran out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// `commit` or `rollback` was called with no open transaction.
    #[error("no transaction in progress")]
    NoTransaction,

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Create a new operation error.
    pub fn operation(
        backend: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CacheError::OperationFailed {
            backend: backend.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid key error.
    pub fn invalid_key(key: impl Into<String>, reason: &'static str) -> Self {
        CacheError::InvalidKey {
            key: key.into(),
            reason,
        }
    }

    /// Whether this error came from the backend rather than from the caller.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, CacheError::OperationFailed { .. })
    }
}
