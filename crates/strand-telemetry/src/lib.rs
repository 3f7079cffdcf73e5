//! Strand Telemetry - logging for every Strand context.
//!
//! This crate provides:
//! - [`LogConfig`] and [`setup_logging`], a `tracing-subscriber` setup with
//!   pretty, compact, JSON and full formats
//! - [`ContextInfo`], the identity of the running context attached to a
//!   span so interleaved logs from several contexts stay readable
//!
//! # Example
//!
//! ```rust,no_run
//! use strand_core::{ContextKind, PeerId};
//! use strand_telemetry::{ContextInfo, LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), strand_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .format(LogFormat::Compact)
//!     .directive("strand_bus=trace");
//! setup_logging(&config)?;
//!
//! let context = ContextInfo::new(ContextKind::Background, PeerId::new(), "background");
//! let _guard = context.span().entered();
//! tracing::info!("context started");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod context;
mod error;
mod logging;

pub use context::ContextInfo;
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
