//! Per-location write leases held by the authoritative context.
//!
//! Writers queue for a location in arrival order. A remote writer holds its
//! lease across several messages, so remote leases expire on their own after
//! a timeout in case the holder disappears mid-transaction.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use strand_core::{KeyedGuard, KeyedMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default time a remote writer may hold a lease.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);

struct Held {
    location: String,
    _guard: KeyedGuard,
    expiry: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    queue: KeyedMutex,
    held: DashMap<Uuid, Held>,
}

/// Write leases keyed by location.
#[derive(Clone)]
pub(crate) struct Leases {
    inner: Arc<Inner>,
    timeout: Duration,
}

impl std::fmt::Debug for Leases {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leases")
            .field("held", &self.inner.held.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Leases {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            timeout,
        }
    }

    /// Wait for `location` and hold it for a local writer until the guard drops.
    pub(crate) async fn local(&self, location: &str) -> KeyedGuard {
        self.inner.queue.lock(location).await
    }

    /// Wait for `location` and hold it for a remote writer.
    pub(crate) async fn acquire(&self, location: &str) -> Uuid {
        let guard = self.inner.queue.lock(location).await;
        let id = Uuid::new_v4();
        let expiry = tokio::spawn(expire(
            Arc::downgrade(&self.inner),
            id,
            self.timeout,
        ));
        self.inner.held.insert(
            id,
            Held {
                location: location.to_owned(),
                _guard: guard,
                expiry,
            },
        );
        debug!(location, lease = %id, "lease granted");
        id
    }

    /// Release a remote lease. Returns whether it was still held.
    pub(crate) fn release(&self, id: Uuid) -> bool {
        match self.inner.held.remove(&id) {
            Some((_, held)) => {
                held.expiry.abort();
                debug!(location = %held.location, lease = %id, "lease released");
                true
            },
            None => false,
        }
    }

    /// Drop every remote lease on `location`.
    pub(crate) fn revoke(&self, location: &str) -> usize {
        let ids: Vec<Uuid> = self
            .inner
            .held
            .iter()
            .filter(|held| held.location == location)
            .map(|held| *held.key())
            .collect();
        ids.into_iter().filter(|id| self.release(*id)).count()
    }

    /// Whether `location` is held by anyone.
    pub(crate) fn is_held(&self, location: &str) -> bool {
        self.inner.queue.is_locked(location)
    }
}

async fn expire(inner: Weak<Inner>, id: Uuid, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(inner) = inner.upgrade()
        && let Some((_, held)) = inner.held.remove(&id)
    {
        warn!(location = %held.location, lease = %id, "lease expired before release");
    }
}
