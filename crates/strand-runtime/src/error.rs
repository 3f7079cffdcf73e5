//! Runtime error types.

use strand_core::ContextKind;
use thiserror::Error;

/// Errors that can occur while wiring or running a context.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The ports or storage given do not fit the context kind.
    #[error("cannot wire a {kind} context: {message}")]
    Wiring {
        /// Kind being built.
        kind: ContextKind,
        /// What is wrong.
        message: String,
    },

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] strand_config::ConfigError),

    /// Logging could not be set up.
    #[error(transparent)]
    Telemetry(#[from] strand_telemetry::TelemetryError),

    /// State engine error.
    #[error(transparent)]
    State(#[from] strand_state::StateError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
