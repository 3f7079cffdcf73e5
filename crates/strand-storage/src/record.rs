//! Persisted state records addressed by [`Location`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strand_core::{Location, Value};
use tracing::debug;

use crate::error::StorageResult;
use crate::kv::{KvStore, ScopedKvStore};

/// The persisted shape of one state instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The flattened document contents.
    pub data: Value,
    /// Schema version. Absent for data written before versioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl Record {
    /// A record with the given data and version.
    #[must_use]
    pub fn new(data: Value, version: u64) -> Self {
        Self {
            data,
            version: Some(version),
        }
    }
}

/// Reads and writes [`Record`]s, one per location.
///
/// A location `a/b/c` is stored under namespace `a/b`, key `c`.
#[derive(Clone)]
pub struct RecordStore {
    kv: Arc<dyn KvStore>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Wrap a raw store.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The raw store underneath.
    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    fn scope(&self, location: &Location) -> StorageResult<ScopedKvStore> {
        ScopedKvStore::new(Arc::clone(&self.kv), location.namespace())
    }

    /// Load the record for `location`, if one was saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the stored bytes are not a record.
    pub async fn load(&self, location: &Location) -> StorageResult<Option<Record>> {
        let record = self.scope(location)?.get_json(location.key()).await?;
        debug!(%location, found = record.is_some(), "loaded record");
        Ok(record)
    }

    /// Save the record for `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the backend fails.
    pub async fn save(&self, location: &Location, record: &Record) -> StorageResult<()> {
        self.scope(location)?
            .set_json(location.key(), record)
            .await?;
        debug!(%location, version = ?record.version, "saved record");
        Ok(())
    }

    /// Delete the record for `location`. Returns `true` if one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn delete(&self, location: &Location) -> StorageResult<bool> {
        let existed = self.scope(location)?.delete(location.key()).await?;
        debug!(%location, existed, "deleted record");
        Ok(existed)
    }

    /// Locations with a saved record directly under `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn list(&self, parent: &Location) -> StorageResult<Vec<Location>> {
        let namespace = parent.segments().join("/");
        let keys = self.kv.list_keys(&namespace).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| parent.child(key).ok())
            .collect())
    }

    /// Delete every record directly under `parent`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn delete_all(&self, parent: &Location) -> StorageResult<u64> {
        let namespace = parent.segments().join("/");
        self.kv.clear_namespace(&namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn loc(s: &str) -> Location {
        s.parse().unwrap()
    }

    fn store() -> (RecordStore, Arc<MemoryKvStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        (RecordStore::new(kv.clone()), kv)
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (records, kv) = store();
        let record = Record::new(Value::from_iter([("n", 2)]), 3);
        records.save(&loc("proj/s/x"), &record).await.unwrap();

        assert_eq!(records.load(&loc("proj/s/x")).await.unwrap(), Some(record));
        assert!(kv.exists("proj/s", "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_record_is_none() {
        let (records, _) = store();
        assert!(records.load(&loc("proj/s/none")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unversioned_record_decodes() {
        let (records, kv) = store();
        kv.set("proj/s", "old", br#"{"data":{"n":1}}"#.to_vec())
            .await
            .unwrap();

        let record = records.load(&loc("proj/s/old")).await.unwrap().unwrap();
        assert_eq!(record.version, None);
        assert_eq!(record.data.get("n"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (records, _) = store();
        for name in ["b", "a"] {
            records
                .save(&loc(&format!("proj/s/{name}")), &Record::new(Value::map(), 1))
                .await
                .unwrap();
        }
        let listed = records.list(&loc("proj/s")).await.unwrap();
        assert_eq!(listed, vec![loc("proj/s/a"), loc("proj/s/b")]);

        assert!(records.delete(&loc("proj/s/a")).await.unwrap());
        assert!(!records.delete(&loc("proj/s/a")).await.unwrap());
        assert_eq!(records.delete_all(&loc("proj/s")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_single_segment_location_uses_root_namespace() {
        let (records, kv) = store();
        records
            .save(&loc("settings"), &Record::new(Value::Null, 0))
            .await
            .unwrap();
        assert!(kv.exists("/", "settings").await.unwrap());
    }
}
