#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Strand Runtime - wires one context's bus and store.
//!
//! Every context of an extension (background, content script, page frame,
//! popup, panel) builds exactly one [`Runtime`] at startup and passes it to
//! whatever needs the bus or state. Nothing in Strand is a global.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use strand_core::ContextKind;
//! use strand_runtime::Runtime;
//!
//! let runtime = Runtime::builder(ContextKind::Background)
//!     .extension_port(host_port)
//!     .storage(Arc::new(browser_storage))
//!     .config(strand_config::Config::load(None)?)
//!     .build()?;
//! ```

pub mod config_bridge;
pub mod error;
pub mod prelude;

mod runtime;

pub use error::{RuntimeError, RuntimeResult};
pub use runtime::{Runtime, RuntimeBuilder};

/// Install the global logger described by `config`'s `[logging]` section.
///
/// # Errors
///
/// Returns an error if the logging directives do not parse or a logger is
/// already installed.
pub fn init_logging(config: &strand_config::Config) -> RuntimeResult<()> {
    strand_telemetry::setup_logging(&config_bridge::to_log_config(config))?;
    Ok(())
}
