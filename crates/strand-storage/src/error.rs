//! Storage error types.

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The host's backend reported a failure.
    #[error("storage backend failed: {0}")]
    Backend(String),

    /// Stored bytes could not be decoded, or a value could not be encoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// A namespace or key is not addressable.
    #[error("invalid {part} '{value}': {reason}")]
    InvalidKey {
        /// `namespace` or `key`.
        part: &'static str,
        /// The rejected text.
        value: String,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
