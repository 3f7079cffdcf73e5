//! Core error types.

use thiserror::Error;

/// Errors raised by core value and location handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A location path was empty or contained an invalid segment.
    #[error("invalid location: {0}")]
    InvalidLocation(String),

    /// A float that JSON cannot carry (NaN or infinite).
    #[error("non-finite float cannot be encoded")]
    NonFiniteFloat,

    /// A payload did not follow the value encoding.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// A tagged object carried a tag this decoder does not handle.
    #[error("unsupported tag: {0}")]
    UnsupportedTag(String),

    /// A queued task never produced its output.
    #[error("queue lane {0} dropped the task")]
    QueueClosed(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
