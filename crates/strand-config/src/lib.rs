#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Layered configuration for the Strand runtime.
//!
//! # Usage
//!
//! ```rust,no_run
//! use strand_config::Config;
//!
//! let config = Config::load(Some(std::path::Path::new("strand.toml"))).unwrap();
//! println!("probing peers every {:?}", config.bus.liveness_interval());
//! ```
//!
//! # Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Environment variables** (`STRAND_*`)
//! 2. **Config file** passed to [`Config::load`]
//! 3. **Embedded defaults** (`defaults.toml` compiled into the binary)
//!
//! This crate has no dependencies on other Strand crates. Conversion into
//! bus, store and logging settings happens in the runtime.

/// Environment variable overrides.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file loading.
pub mod loader;
/// Layer merging.
pub mod merge;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use types::*;

impl Config {
    /// Load configuration from defaults, an optional file and `STRAND_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file is malformed, an environment
    /// variable does not parse, or the final configuration fails validation.
    pub fn load(path: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(path)
    }

    /// Parse a configuration from a TOML string layered over the defaults.
    ///
    /// Environment variables are not consulted.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the string is malformed or fails
    /// validation.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let mut merged = Self::default_tree()?;
        let overlay: toml::Value =
            toml::from_str(content).map_err(|e| ConfigError::Parse {
                origin: "inline configuration".to_owned(),
                source: e,
            })?;
        merge::deep_merge(&mut merged, &overlay);
        let config: Self = merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                origin: "inline configuration".to_owned(),
                source: e,
            })?;
        validate::validate(&config)?;
        Ok(config)
    }

    fn default_tree() -> ConfigResult<toml::Value> {
        Ok(toml::Value::try_from(Self::default())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_str_layers_over_defaults() {
        let config = Config::from_toml_str("[state]\npersist_on_commit = false").unwrap();
        assert!(!config.state.persist_on_commit);
        assert_eq!(config.state.lease_timeout_secs, 30);
        assert_eq!(config.bus, BusSection::default());
    }

    #[test]
    fn test_from_toml_str_validates() {
        let err = Config::from_toml_str("[logging]\nlevel = \"\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.bus.liveness_interval().as_secs(), 300);
        assert_eq!(config.bus.blob_idle_timeout().as_secs(), 60);
        assert_eq!(config.state.lease_timeout().as_secs(), 30);
    }
}
