//! Bridge from [`strand_config::Config`] to the settings each component takes.

use strand_bus::BusBuilder;
use strand_config::{Config, LoggingSection};
use strand_state::StoreSettings;
use strand_telemetry::{LogConfig, LogFormat};

/// Apply the `[bus]` section to a bus builder.
#[must_use]
pub fn configure_bus(cfg: &Config, builder: BusBuilder) -> BusBuilder {
    builder
        .liveness_interval(cfg.bus.liveness_interval())
        .blob_idle_timeout(cfg.bus.blob_idle_timeout())
}

/// Convert the `[state]` section to [`StoreSettings`].
#[must_use]
pub fn to_store_settings(cfg: &Config) -> StoreSettings {
    StoreSettings {
        lease_timeout: cfg.state.lease_timeout(),
        persist_on_commit: cfg.state.persist_on_commit,
    }
}

/// Convert the `[logging]` section to a [`LogConfig`].
#[must_use]
pub fn to_log_config(cfg: &Config) -> LogConfig {
    let LoggingSection {
        level,
        format,
        directives,
    } = &cfg.logging;
    // Validation has already rejected unknown names.
    let format = format.parse::<LogFormat>().unwrap_or_default();
    directives
        .iter()
        .fold(LogConfig::new(level.clone()).format(format), |log, d| {
            log.directive(d.clone())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_store_settings() {
        let cfg = Config::from_toml_str(
            "[state]\nlease_timeout_secs = 5\npersist_on_commit = false",
        )
        .unwrap();
        let settings = to_store_settings(&cfg);
        assert_eq!(settings.lease_timeout, Duration::from_secs(5));
        assert!(!settings.persist_on_commit);
    }

    #[test]
    fn test_log_config() {
        let cfg = Config::from_toml_str(
            "[logging]\nlevel = \"debug\"\nformat = \"json\"\ndirectives = [\"strand_bus=trace\"]",
        )
        .unwrap();
        let log = to_log_config(&cfg);
        assert_eq!(log.level, "debug");
        assert_eq!(log.format, LogFormat::Json);
        assert_eq!(log.directives, vec!["strand_bus=trace"]);
    }
}
