//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Longest accepted interval or timeout (one day).
const MAX_SECS: u64 = 86_400;

const LOG_FORMATS: &[&str] = &["pretty", "compact", "json", "full"];

/// Validate a fully merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_bus(config)?;
    validate_state(config)?;
    validate_logging(config)?;
    Ok(())
}

fn check_secs(field: &str, value: u64) -> ConfigResult<()> {
    if value == 0 || value > MAX_SECS {
        return Err(ConfigError::Invalid {
            field: field.to_owned(),
            message: format!("{value} is out of range; must be between 1 and {MAX_SECS}"),
        });
    }
    Ok(())
}

fn validate_bus(config: &Config) -> ConfigResult<()> {
    check_secs("bus.liveness_interval_secs", config.bus.liveness_interval_secs)?;
    check_secs("bus.blob_idle_timeout_secs", config.bus.blob_idle_timeout_secs)
}

fn validate_state(config: &Config) -> ConfigResult<()> {
    check_secs("state.lease_timeout_secs", config.state.lease_timeout_secs)
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let logging = &config.logging;
    if logging.level.trim().is_empty() {
        return Err(ConfigError::Invalid {
            field: "logging.level".to_owned(),
            message: "must not be empty".to_owned(),
        });
    }
    if !LOG_FORMATS.contains(&logging.format.as_str()) {
        return Err(ConfigError::Invalid {
            field: "logging.format".to_owned(),
            message: format!(
                "unsupported format '{}'; expected one of: {}",
                logging.format,
                LOG_FORMATS.join(", ")
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = Config::default();
        config.bus.liveness_interval_secs = 0;
        let err = validate(&config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { ref field, .. } if field == "bus.liveness_interval_secs"
        ));
    }

    #[test]
    fn test_huge_lease_rejected() {
        let mut config = Config::default();
        config.state.lease_timeout_secs = MAX_SECS.saturating_add(1);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("logging.format"));
    }
}
