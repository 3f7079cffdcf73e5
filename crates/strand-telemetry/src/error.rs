//! Telemetry error types.

use thiserror::Error;

/// Why logging could not be installed.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The level, a directive or a format name did not parse.
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    /// Something already installed a global subscriber in this process.
    #[error("log subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
