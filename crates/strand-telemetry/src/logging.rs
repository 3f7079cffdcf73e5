//! Subscriber setup for one context.
//!
//! Every context installs its own subscriber once at start. Filters take
//! the usual `EnvFilter` syntax, so `strand_bus=trace` turns on routing
//! detail without flooding the rest.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::{self as subscriber_fmt, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{TelemetryError, TelemetryResult};

/// How events are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured, for a developer watching one context.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON, for collecting logs from many contexts.
    Json,
    /// The `tracing-subscriber` default layout.
    Full,
}

impl LogFormat {
    /// Every format with its config name.
    pub const ALL: [(&'static str, Self); 4] = [
        ("pretty", Self::Pretty),
        ("compact", Self::Compact),
        ("json", Self::Json),
        ("full", Self::Full),
    ];

    /// Config name of the format.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, format)| *format)
            .ok_or_else(|| TelemetryError::InvalidFilter(format!("unknown log format '{s}'")))
    }
}

/// Which standard stream receives events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// Standard error.
    #[default]
    Stderr,
}

/// Subscriber settings for one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Base filter, e.g. `info` or `warn,strand_state=debug`.
    pub level: String,
    /// Rendering.
    pub format: LogFormat,
    /// Output stream.
    pub target: LogTarget,
    /// Directives appended to `level`.
    pub directives: Vec<String>,
    /// Colour escapes. Off when the output is collected.
    pub ansi: bool,
    /// Prefix each event with the time.
    pub timestamps: bool,
    /// Emit an event when a span opens and closes.
    pub span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Pretty,
            target: LogTarget::Stderr,
            directives: Vec::new(),
            ansi: true,
            timestamps: true,
            span_events: false,
        }
    }
}

impl LogConfig {
    /// Defaults at `level`.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Self::default()
        }
    }

    /// Set the rendering.
    #[must_use]
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the output stream.
    #[must_use]
    pub fn target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Append one filter directive.
    #[must_use]
    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Turn timestamps on or off.
    #[must_use]
    pub fn timestamps(mut self, on: bool) -> Self {
        self.timestamps = on;
        self
    }

    /// Turn colour on or off.
    #[must_use]
    pub fn ansi(mut self, on: bool) -> Self {
        self.ansi = on;
        self
    }

    /// Turn span open/close events on or off.
    #[must_use]
    pub fn span_events(mut self, on: bool) -> Self {
        self.span_events = on;
        self
    }

    /// The combined filter string handed to `EnvFilter`.
    #[must_use]
    pub fn filter_spec(&self) -> String {
        std::iter::once(self.level.trim())
            .chain(self.directives.iter().map(String::as_str).map(str::trim))
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn filter(&self) -> TelemetryResult<EnvFilter> {
        EnvFilter::try_new(self.filter_spec())
            .map_err(|e| TelemetryError::InvalidFilter(e.to_string()))
    }
}

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// [`TelemetryError::InvalidFilter`] if the filter does not parse,
/// [`TelemetryError::AlreadyInstalled`] if this process already has a
/// subscriber.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.filter()?;
    match config.target {
        LogTarget::Stdout => install(config, filter, std::io::stdout),
        LogTarget::Stderr => install(config, filter, std::io::stderr),
    }
}

/// [`setup_logging`] with [`LogConfig::default`].
///
/// # Errors
///
/// See [`setup_logging`].
pub fn setup_default_logging() -> TelemetryResult<()> {
    setup_logging(&LogConfig::default())
}

fn install<W>(config: &LogConfig, filter: EnvFilter, writer: W) -> TelemetryResult<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let spans = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = subscriber_fmt::layer()
        .with_writer(writer)
        .with_ansi(config.ansi)
        .with_span_events(spans);
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry.with(layer.pretty()).try_init(),
        (LogFormat::Pretty, false) => registry.with(layer.pretty().without_time()).try_init(),
        (LogFormat::Compact, true) => registry.with(layer.compact()).try_init(),
        (LogFormat::Compact, false) => registry.with(layer.compact().without_time()).try_init(),
        (LogFormat::Json, true) => registry.with(layer.json()).try_init(),
        (LogFormat::Json, false) => registry.with(layer.json().without_time()).try_init(),
        (LogFormat::Full, true) => registry.with(layer).try_init(),
        (LogFormat::Full, false) => registry.with(layer.without_time()).try_init(),
    };
    installed.map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}
