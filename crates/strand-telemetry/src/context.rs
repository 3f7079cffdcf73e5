//! Identity of the running context, for log correlation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strand_core::{ContextKind, PeerId};

/// Which context a log line came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInfo {
    /// Kind of context.
    pub kind: ContextKind,
    /// Identity minted at start.
    pub peer: PeerId,
    /// Host route to the context.
    pub address: String,
    /// When the context started.
    pub started_at: DateTime<Utc>,
}

impl ContextInfo {
    /// Describe a context starting now.
    #[must_use]
    pub fn new(kind: ContextKind, peer: PeerId, address: impl Into<String>) -> Self {
        Self {
            kind,
            peer,
            address: address.into(),
            started_at: Utc::now(),
        }
    }

    /// Milliseconds since start.
    #[must_use]
    pub fn uptime_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }

    /// Span carrying the context's identity.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "context",
            kind = %self.kind,
            peer = %self.peer,
            address = %self.address,
        )
    }
}
