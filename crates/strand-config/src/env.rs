//! `STRAND_*` environment overrides.
//!
//! Environment variables take precedence over the config file. Each variable
//! maps to exactly one field and is parsed according to that field's type.

use std::collections::HashMap;
use std::hash::BuildHasher;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::set_path;

/// Prefix shared by every recognised variable.
pub const ENV_PREFIX: &str = "STRAND_";

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Integer,
    Bool,
    Text,
    /// Comma separated.
    List,
}

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: FieldKind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "STRAND_BUS_LIVENESS_INTERVAL_SECS",
        field_path: "bus.liveness_interval_secs",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "STRAND_BUS_BLOB_IDLE_TIMEOUT_SECS",
        field_path: "bus.blob_idle_timeout_secs",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "STRAND_STATE_LEASE_TIMEOUT_SECS",
        field_path: "state.lease_timeout_secs",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "STRAND_STATE_PERSIST_ON_COMMIT",
        field_path: "state.persist_on_commit",
        kind: FieldKind::Bool,
    },
    EnvMapping {
        var_name: "STRAND_LOG_LEVEL",
        field_path: "logging.level",
        kind: FieldKind::Text,
    },
    EnvMapping {
        var_name: "STRAND_LOG_FORMAT",
        field_path: "logging.format",
        kind: FieldKind::Text,
    },
    EnvMapping {
        var_name: "STRAND_LOG_DIRECTIVES",
        field_path: "logging.directives",
        kind: FieldKind::List,
    },
];

/// Snapshot the `STRAND_*` variables of the current process.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}

/// Apply every recognised variable in `env_vars` on top of `merged`.
///
/// Returns the number of variables applied.
///
/// # Errors
///
/// Returns [`ConfigError::Env`] if a value does not parse as its
/// field's type.
pub fn apply_env_overrides<S: BuildHasher>(
    merged: &mut toml::Value,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;
    for mapping in ENV_MAPPINGS {
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };
        let value = coerce(mapping, raw)?;
        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var override"
        );
        set_path(merged, mapping.field_path, value);
        count = count.saturating_add(1);
    }
    Ok(count)
}

fn coerce(mapping: &EnvMapping, raw: &str) -> ConfigResult<toml::Value> {
    let raw = raw.trim();
    let invalid = |expected: &str| ConfigError::Env {
        var: mapping.var_name.to_owned(),
        message: format!("expected {expected}, got '{raw}'"),
    };
    match mapping.kind {
        FieldKind::Integer => raw
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|_| invalid("an integer")),
        FieldKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(toml::Value::Boolean(true)),
            "false" | "0" | "no" | "off" => Ok(toml::Value::Boolean(false)),
            _ => Err(invalid("a boolean")),
        },
        FieldKind::Text => Ok(toml::Value::String(raw.to_owned())),
        FieldKind::List => Ok(toml::Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_owned()))
                .collect(),
        )),
    }
}
