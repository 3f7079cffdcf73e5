//! Wire envelopes exchanged between bridges.
//!
//! A request is an [`Envelope`] serialized as JSON. Every request gets
//! exactly one [`Reply`].

use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};
use strand_core::PeerId;
use uuid::Uuid;

use crate::error::{BusError, BusResult};

/// Register a proxy for the calling context. Args: `[name]`.
pub const PROXY_ON: &str = "strand.bus.proxy.on";
/// Retract a proxy for the calling context. Args: `[name]`.
pub const PROXY_OFF: &str = "strand.bus.proxy.off";
/// Retract every proxy the calling context registered before it restarted.
pub const PROXY_RESET: &str = "strand.bus.proxy.reset";
/// Fetch the bytes behind a blob reference. Args: `[id]`.
pub const BLOB_RESOLVE: &str = "strand.bus.blob.resolve";
/// Liveness probe. Answered with the receiver's peer id.
pub const PING: &str = "strand.peer.ping";
/// Prefix for the names signal answers are registered under.
pub const SIGNAL_PREFIX: &str = "strand.signal.";

const ADMIN_NAMES: [&str; 5] = [PROXY_ON, PROXY_OFF, PROXY_RESET, BLOB_RESOLVE, PING];

/// A request crossing a context boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message id, for tracing.
    pub id: Uuid,
    /// Action name.
    pub name: String,
    /// Serialized arguments.
    #[serde(default)]
    pub args: Vec<Json>,
    /// Identity of the sending context.
    pub peer: PeerId,
}

impl Envelope {
    /// Build an envelope with a fresh id.
    pub fn new(name: impl Into<String>, args: Vec<Json>, peer: PeerId) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            args,
            peer,
        }
    }

    /// Whether the name is handled by the bridge itself.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        ADMIN_NAMES.contains(&self.name.as_str())
    }

    /// Encode as a string payload.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if encoding fails.
    pub fn encode(&self) -> BusResult<String> {
        serde_json::to_string(self).map_err(|e| BusError::Serialization(e.to_string()))
    }

    /// Decode a string payload.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Protocol`] if the payload is not an envelope.
    pub fn decode(payload: &str) -> BusResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// The first argument as a string.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Protocol`] if it is missing or not a string.
    pub fn name_arg(&self) -> BusResult<&str> {
        self.args
            .first()
            .and_then(Json::as_str)
            .ok_or_else(|| BusError::Protocol(format!("{} requires a string argument", self.name)))
    }
}

/// The answer to an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    /// A handler produced a value.
    Value {
        /// Serialized value.
        payload: Json,
    },
    /// No handler produced a value.
    Absent,
    /// A handler failed.
    Error {
        /// The handler's message.
        message: String,
    },
}

impl Reply {
    /// Encode as a string payload.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            json!({ "kind": "error", "message": e.to_string() }).to_string()
        })
    }

    /// Decode a string payload.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Protocol`] if the payload is not a reply.
    pub fn decode(payload: &str) -> BusResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let peer = PeerId::new();
        let env = Envelope::new("ping", vec![json!(1)], peer);
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert!(!decoded.is_admin());
        assert!(Envelope::new(PING, vec![], peer).is_admin());
    }

    #[test]
    fn test_reply_tags() {
        assert_eq!(Reply::Absent.encode(), r#"{"kind":"absent"}"#);
        let reply = Reply::Value { payload: json!("pong") };
        assert_eq!(reply.encode(), r#"{"kind":"value","payload":"pong"}"#);
        assert_eq!(Reply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(BusError::Protocol(_))
        ));
        assert!(matches!(
            Reply::decode(r#"{"kind":"maybe"}"#),
            Err(BusError::Protocol(_))
        ));
    }

    #[test]
    fn test_name_arg() {
        let env = Envelope::new(PROXY_ON, vec![json!("ping")], PeerId::new());
        assert_eq!(env.name_arg().unwrap(), "ping");
        let env = Envelope::new(PROXY_ON, vec![], PeerId::new());
        assert!(env.name_arg().is_err());
    }
}
