//! Value serialization for the bus.
//!
//! Payloads are JSON. Binary values do not travel inline: each one is parked
//! in the sender's [`BlobTable`] and replaced by a reference
//! `{"$blob": {"id": ..., "peer": ...}}`. The receiver resolves references
//! through a [`BlobSource`] that asks the sender for the bytes. A reference
//! stays valid until it has been idle for the table's timeout, so it can be
//! read more than once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};
use strand_core::value::BLOB_TAG;
use strand_core::{CoreError, PeerId, Value};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{BusError, BusResult};

/// Default idle time after which a blob reference is revoked.
pub const DEFAULT_BLOB_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct BlobEntry {
    bytes: Vec<u8>,
    last_access: Instant,
}

/// Blobs this context has handed out references to.
#[derive(Debug)]
pub struct BlobTable {
    entries: DashMap<String, BlobEntry>,
    idle_timeout: Duration,
}

impl BlobTable {
    /// Create a table revoking entries idle for longer than `idle_timeout`.
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_timeout,
        }
    }

    /// Park `bytes` and return the reference id.
    pub fn insert(&self, bytes: Vec<u8>) -> String {
        self.sweep();
        let id = Uuid::new_v4().to_string();
        trace!(id = %id, len = bytes.len(), "blob parked");
        self.entries.insert(
            id.clone(),
            BlobEntry {
                bytes,
                last_access: Instant::now(),
            },
        );
        id
    }

    /// Read a blob, refreshing its idle timer.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.sweep();
        self.entries.get_mut(id).map(|mut entry| {
            entry.last_access = Instant::now();
            entry.bytes.clone()
        })
    }

    /// Revoke every entry idle past the timeout. Returns how many were revoked.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let idle_timeout = self.idle_timeout;
        self.entries
            .retain(|_, entry| entry.last_access.elapsed() <= idle_timeout);
        let revoked = before.saturating_sub(self.entries.len());
        if revoked > 0 {
            debug!(revoked, "idle blob references revoked");
        }
        revoked
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BlobTable {
    fn default() -> Self {
        Self::new(DEFAULT_BLOB_IDLE_TIMEOUT)
    }
}

/// Fetches blob bytes from the context that sent a payload.
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Fetch the bytes behind reference `id`.
    async fn fetch(&self, id: &str) -> BusResult<Vec<u8>>;
}

/// A source that resolves nothing. For payloads that cannot carry remote blobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBlobs;

#[async_trait]
impl BlobSource for NoBlobs {
    async fn fetch(&self, id: &str) -> BusResult<Vec<u8>> {
        Err(BusError::Protocol(format!("no source for blob {id}")))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobRef {
    id: String,
    peer: PeerId,
}

impl BlobRef {
    fn parse(body: Json) -> Result<Self, CoreError> {
        serde_json::from_value(body).map_err(|e| CoreError::InvalidEncoding(e.to_string()))
    }
}

/// Encodes values into wire JSON and back for one context.
#[derive(Debug, Clone)]
pub struct Serializer {
    peer: PeerId,
    blobs: Arc<BlobTable>,
}

impl Serializer {
    /// Create a serializer owning blobs on behalf of `peer`.
    #[must_use]
    pub fn new(peer: PeerId, idle_timeout: Duration) -> Self {
        Self {
            peer,
            blobs: Arc::new(BlobTable::new(idle_timeout)),
        }
    }

    /// The blob table behind this serializer.
    #[must_use]
    pub fn blobs(&self) -> &BlobTable {
        &self.blobs
    }

    /// Encode a value, parking its binary payloads.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] for values JSON cannot carry.
    pub fn serialize(&self, value: &Value) -> BusResult<Json> {
        let peer = self.peer;
        let blobs = &self.blobs;
        Ok(value.encode_with(&mut |bytes| {
            let id = blobs.insert(bytes.to_vec());
            Ok(json!({ BLOB_TAG: { "id": id, "peer": peer } }))
        })?)
    }

    /// Encode an argument list.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] for values JSON cannot carry.
    pub fn serialize_args(&self, args: &[Value]) -> BusResult<Vec<Json>> {
        args.iter().map(|v| self.serialize(v)).collect()
    }

    /// Decode a value, fetching remote blobs through `source`.
    ///
    /// References to this context's own blobs resolve from the local table.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Protocol`] for malformed payloads and unknown or
    /// revoked references.
    pub async fn deserialize(&self, json: Json, source: &dyn BlobSource) -> BusResult<Value> {
        let mut refs = Vec::new();
        Value::decode_with(json.clone(), &mut |tag, body| {
            if tag != BLOB_TAG {
                return Err(CoreError::UnsupportedTag(tag.to_owned()));
            }
            refs.push(BlobRef::parse(body)?);
            Ok(Value::Null)
        })?;

        let mut fetched: HashMap<String, Vec<u8>> = HashMap::with_capacity(refs.len());
        for blob in refs {
            if fetched.contains_key(&blob.id) {
                continue;
            }
            let bytes = if blob.peer == self.peer {
                self.blobs
                    .get(&blob.id)
                    .ok_or_else(|| BusError::Protocol(format!("unknown blob {}", blob.id)))?
            } else {
                source.fetch(&blob.id).await?
            };
            fetched.insert(blob.id, bytes);
        }

        Ok(Value::decode_with(json, &mut |_, body| {
            let blob = BlobRef::parse(body)?;
            fetched
                .get(&blob.id)
                .map(|bytes| Value::Bytes(bytes.clone()))
                .ok_or_else(|| CoreError::InvalidEncoding(format!("unresolved blob {}", blob.id)))
        })?)
    }

    /// Decode an argument list.
    ///
    /// # Errors
    ///
    /// See [`deserialize`](Self::deserialize).
    pub async fn deserialize_args(
        &self,
        args: Vec<Json>,
        source: &dyn BlobSource,
    ) -> BusResult<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.deserialize(arg, source).await?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Resolves from another serializer's table, counting fetches.
    struct Remote {
        serializer: Serializer,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl BlobSource for Remote {
        async fn fetch(&self, id: &str) -> BusResult<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.serializer
                .blobs()
                .get(id)
                .ok_or_else(|| BusError::Protocol(format!("unknown blob {id}")))
        }
    }

    fn sample() -> Value {
        Value::from_iter([
            ("name", Value::from("shot.png")),
            ("data", Value::Bytes(vec![137, 80, 78, 71])),
            (
                "thumbs",
                Value::List(vec![Value::Bytes(vec![1]), Value::Bytes(vec![2, 3])]),
            ),
        ])
    }

    #[tokio::test]
    async fn test_bytes_travel_as_references() {
        let serializer = Serializer::new(PeerId::new(), DEFAULT_BLOB_IDLE_TIMEOUT);
        let json = serializer.serialize(&sample()).unwrap();
        assert!(json["data"]["$blob"]["id"].is_string());
        assert_eq!(serializer.blobs().len(), 3);
    }

    #[tokio::test]
    async fn test_round_trip_across_contexts() {
        let sender = Serializer::new(PeerId::new(), DEFAULT_BLOB_IDLE_TIMEOUT);
        let receiver = Serializer::new(PeerId::new(), DEFAULT_BLOB_IDLE_TIMEOUT);
        let json = sender.serialize(&sample()).unwrap();

        let remote = Remote {
            serializer: sender.clone(),
            fetches: AtomicUsize::new(0),
        };
        let value = receiver.deserialize(json, &remote).await.unwrap();
        assert_eq!(value, sample());
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_own_references_resolve_locally() {
        let serializer = Serializer::new(PeerId::new(), DEFAULT_BLOB_IDLE_TIMEOUT);
        let json = serializer.serialize(&sample()).unwrap();
        let value = serializer.deserialize(json, &NoBlobs).await.unwrap();
        assert_eq!(value, sample());
    }

    #[tokio::test]
    async fn test_reference_survives_repeated_reads() {
        let serializer = Serializer::new(PeerId::new(), DEFAULT_BLOB_IDLE_TIMEOUT);
        let json = serializer.serialize(&Value::Bytes(vec![9; 4])).unwrap();
        for _ in 0..3 {
            let value = serializer.deserialize(json.clone(), &NoBlobs).await.unwrap();
            assert_eq!(value, Value::Bytes(vec![9; 4]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_references_are_revoked() {
        let serializer = Serializer::new(PeerId::new(), Duration::from_secs(60));
        let json = serializer.serialize(&Value::Bytes(vec![1, 2])).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(serializer.deserialize(json.clone(), &NoBlobs).await.is_ok());

        // The read above refreshed the timer.
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(serializer.deserialize(json.clone(), &NoBlobs).await.is_ok());

        tokio::time::advance(Duration::from_secs(61)).await;
        let err = serializer.deserialize(json, &NoBlobs).await.unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
        assert!(serializer.blobs().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_reference_is_protocol_error() {
        let serializer = Serializer::new(PeerId::new(), DEFAULT_BLOB_IDLE_TIMEOUT);
        let err = serializer
            .deserialize(json!({ "$blob": 42 }), &NoBlobs)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_non_finite_float_is_serialization_error() {
        let serializer = Serializer::new(PeerId::new(), DEFAULT_BLOB_IDLE_TIMEOUT);
        let err = serializer.serialize(&Value::Float(f64::NAN)).unwrap_err();
        assert!(matches!(err, BusError::Serialization(_)));
    }
}
