use std::io;
use thiserror::Error;

/// Why a configuration could not be produced.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File that was being read.
        path: String,
        /// I/O failure.
        #[source]
        source: io::Error,
    },

    /// A layer is not valid TOML or does not fit [`Config`](crate::Config).
    #[error("{origin} is not a valid configuration: {source}")]
    Parse {
        /// Which layer failed: a file path, the embedded defaults, the
        /// merged result or an inline string.
        origin: String,
        /// TOML failure.
        #[source]
        source: toml::de::Error,
    },

    /// The file is larger than a configuration file has any reason to be.
    #[error("{path} is {size} bytes, over the {limit} byte limit")]
    TooLarge {
        /// Offending file.
        path: String,
        /// Its size.
        size: u64,
        /// The limit.
        limit: u64,
    },

    /// A value parsed but is out of range.
    #[error("{field}: {message}")]
    Invalid {
        /// Dotted key, e.g. `bus.liveness_interval_secs`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// A `STRAND_*` variable has the wrong shape for its key.
    #[error("{var}: {message}")]
    Env {
        /// Variable name.
        var: String,
        /// What was expected.
        message: String,
    },

    /// The built-in defaults could not be turned back into a TOML tree.
    #[error("cannot encode defaults: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
