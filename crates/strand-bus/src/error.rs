//! Bus error types.

use std::panic::Location as CallSite;

use strand_core::CoreError;
use thiserror::Error;

/// Errors surfaced to callers of `send`/`emit` and friends.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// A handler failed. `site` is where the failing call was made.
    #[error("handler for {name} failed: {message} (called at {site})")]
    Handler {
        /// Action name.
        name: String,
        /// The handler's message, unchanged.
        message: String,
        /// Call site of the `send`/`emit`.
        site: &'static CallSite<'static>,
    },

    /// A payload or envelope was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A value could not be encoded for transport.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A wait ran past its deadline.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl BusError {
    /// The message to carry across a context boundary.
    ///
    /// Handler errors keep only their original message; the receiving side
    /// annotates it with its own call site.
    #[must_use]
    pub fn wire_message(&self) -> String {
        match self {
            Self::Handler { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<CoreError> for BusError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::NonFiniteFloat => Self::Serialization(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// The error type handlers return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<BusError> for HandlerError {
    fn from(e: BusError) -> Self {
        Self::new(e.wire_message())
    }
}

impl From<CoreError> for HandlerError {
    fn from(e: CoreError) -> Self {
        Self::new(e.to_string())
    }
}

/// The remote end of a transport is gone or never existed.
///
/// Bridges swallow this and treat the branch as "no answer".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Nothing is listening at the address.
    #[error("could not establish connection to {0}: receiving end does not exist")]
    Unreachable(String),

    /// The port closed while the request was in flight.
    #[error("message port closed before a response was received")]
    Closed,
}
