//! Configuration types.
//!
//! Every struct implements [`Default`] with the same values as the embedded
//! `defaults.toml`, so a bare `[section]` header produces a working
//! configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for one context's runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bus timing.
    pub bus: BusSection,
    /// State store behaviour.
    pub state: StateSection,
    /// Logging level, format and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// BusSection
// ---------------------------------------------------------------------------

/// Bus timing knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Seconds between liveness probes of peers that hold proxies.
    pub liveness_interval_secs: u64,
    /// Seconds an unread blob reference stays valid.
    pub blob_idle_timeout_secs: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            liveness_interval_secs: 300,
            blob_idle_timeout_secs: 60,
        }
    }
}

impl BusSection {
    /// Liveness probe interval.
    #[must_use]
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    /// Blob idle timeout.
    #[must_use]
    pub fn blob_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.blob_idle_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// StateSection
// ---------------------------------------------------------------------------

/// State store knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    /// Seconds a remote writer may hold a write lease.
    pub lease_timeout_secs: u64,
    /// Persist every committed change instead of only on disconnect.
    pub persist_on_commit: bool,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 30,
            persist_on_commit: true,
        }
    }
}

impl StateSection {
    /// Remote lease timeout.
    #[must_use]
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Level filter (e.g. `"info"`, `"debug"`).
    pub level: String,
    /// One of `pretty`, `compact`, `json`, `full`.
    pub format: String,
    /// Extra filter directives (e.g. `"strand_bus=trace"`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directives: Vec::new(),
        }
    }
}
