//! State error types.

use strand_bus::{BusError, HandlerError};
use strand_core::CoreError;
use strand_storage::StorageError;
use thiserror::Error;

/// Errors from the state engine.
#[derive(Debug, Error)]
pub enum StateError {
    /// The location is not connected in this context.
    #[error("state not connected: {0}")]
    NotConnected(String),

    /// A migration step failed. The instance was left unready.
    #[error("migration to version {version} failed: {message}")]
    Migration {
        /// Target version of the failing step.
        version: u64,
        /// What the step reported.
        message: String,
    },

    /// A strict model was given a key it does not declare.
    #[error("model {model} does not declare field {field}")]
    UndeclaredField {
        /// Model name.
        model: String,
        /// Offending key.
        field: String,
    },

    /// Data referenced a model name nobody registered.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// The authoritative context did not answer.
    #[error("authoritative context unavailable: {0}")]
    Unavailable(String),

    /// A value or operation does not fit the node it targets.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The CRDT document rejected an operation or update.
    #[error("crdt error: {0}")]
    Crdt(String),

    /// Persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A bus call failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A core type rejected its input.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<automerge::AutomergeError> for StateError {
    fn from(e: automerge::AutomergeError) -> Self {
        Self::Crdt(e.to_string())
    }
}

impl From<StateError> for HandlerError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Bus(bus) => Self::from(bus),
            other => Self::new(other.to_string()),
        }
    }
}

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;
