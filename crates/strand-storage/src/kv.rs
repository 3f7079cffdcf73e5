//! The raw store every context persists through.
//!
//! Strand never picks a database. The host hands the authoritative context
//! an `Arc<dyn KvStore>` over whatever the platform offers (extension
//! storage, IndexedDB, a file) and the state engine addresses it as
//! `(namespace, key)` pairs. A location `proj/store/name` lives under
//! namespace `proj/store` and key `name`, so listing a namespace yields the
//! sibling locations.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::{StorageError, StorageResult};

fn check(part: &'static str, value: &str, allow_slash: bool) -> StorageResult<()> {
    let reason = if value.is_empty() {
        "empty"
    } else if value.contains('\0') {
        "contains a null byte"
    } else if !allow_slash && value.contains('/') {
        "contains '/'"
    } else {
        return Ok(());
    };
    Err(StorageError::InvalidKey {
        part,
        value: value.escape_debug().to_string(),
        reason,
    })
}

/// Namespaces are location prefixes and may contain `/`.
pub(crate) fn check_namespace(namespace: &str) -> StorageResult<()> {
    check("namespace", namespace, true)
}

/// Keys are single location segments.
pub(crate) fn check_key(key: &str) -> StorageResult<()> {
    check("key", key, false)
}

/// Byte values under `(namespace, key)`.
///
/// Implementations validate nothing themselves; callers in this crate do.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// The value at `key`, if any.
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Store `value` at `key`, replacing what was there.
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Remove `key`. `true` if it was present.
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// Whether `key` is present.
    async fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        Ok(self.get(namespace, key).await?.is_some())
    }

    /// Keys in `namespace`, in ascending order.
    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>>;

    /// Drop the whole namespace. Returns how many keys went with it.
    async fn clear_namespace(&self, namespace: &str) -> StorageResult<u64>;
}

/// A [`KvStore`] that lives and dies with the process.
///
/// Used by tests and by hosts that persist nothing.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    namespaces: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys across every namespace.
    #[must_use]
    pub fn len(&self) -> usize {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(namespaces.get(namespace).and_then(|keys| keys.get(key)).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        trace!(namespace, key, bytes = value.len(), "kv set");
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        let Some(keys) = namespaces.get_mut(namespace) else {
            return Ok(false);
        };
        let existed = keys.remove(key).is_some();
        if keys.is_empty() {
            namespaces.remove(namespace);
        }
        Ok(existed)
    }

    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(namespaces
            .get(namespace)
            .map_or_else(Vec::new, |keys| keys.keys().cloned().collect()))
    }

    async fn clear_namespace(&self, namespace: &str) -> StorageResult<u64> {
        let removed = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace)
            .map_or(0, |keys| keys.len());
        trace!(namespace, removed, "kv namespace cleared");
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }
}

/// One namespace of a [`KvStore`], checked once, with JSON values.
#[derive(Clone)]
pub struct ScopedKvStore {
    store: Arc<dyn KvStore>,
    namespace: String,
}

impl std::fmt::Debug for ScopedKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ScopedKvStore").field(&self.namespace).finish()
    }
}

impl ScopedKvStore {
    /// Bind `store` to `namespace`.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidKey`] if the namespace is empty or holds a
    /// null byte.
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> StorageResult<Self> {
        let namespace = namespace.into();
        check_namespace(&namespace)?;
        Ok(Self { store, namespace })
    }

    /// The bound namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Raw bytes at `key`.
    ///
    /// # Errors
    ///
    /// An invalid key or a backend failure.
    pub async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        check_key(key)?;
        self.store.get(&self.namespace, key).await
    }

    /// Store raw bytes at `key`.
    ///
    /// # Errors
    ///
    /// An invalid key or a backend failure.
    pub async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        check_key(key)?;
        self.store.set(&self.namespace, key, value).await
    }

    /// Remove `key`; `true` if it was present.
    ///
    /// # Errors
    ///
    /// An invalid key or a backend failure.
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        check_key(key)?;
        self.store.delete(&self.namespace, key).await
    }

    /// Whether `key` is present.
    ///
    /// # Errors
    ///
    /// An invalid key or a backend failure.
    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        check_key(key)?;
        self.store.exists(&self.namespace, key).await
    }

    /// Keys in the namespace, ascending.
    ///
    /// # Errors
    ///
    /// A backend failure.
    pub async fn list_keys(&self) -> StorageResult<Vec<String>> {
        self.store.list_keys(&self.namespace).await
    }

    /// Drop the namespace; returns the number of keys removed.
    ///
    /// # Errors
    ///
    /// A backend failure.
    pub async fn clear(&self) -> StorageResult<u64> {
        self.store.clear_namespace(&self.namespace).await
    }

    /// Decode the JSON at `key`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Corrupt`] if the bytes are not a `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode `value` as JSON at `key`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Corrupt`] if `value` cannot be encoded, or a backend
    /// failure.
    pub async fn set_json<T>(&self, key: &str, value: &T) -> StorageResult<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes).await
    }
}
