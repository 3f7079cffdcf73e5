//! Peer liveness probing.
//!
//! A context that holds registrations on behalf of another context (proxy
//! actions, forwarded subscriptions) watches that peer. Every interval the
//! peer is pinged; it is alive only if it answers with the same [`PeerId`]
//! it registered with. A reloaded context answers from the same address with
//! a fresh id and counts as dead. On the first failed probe every disposer
//! registered for the address runs and the watch is dropped.
//!
//! Disposers are keyed: watching the same key again replaces its disposer,
//! and releasing the last key drops the watch along with its probe task.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use strand_core::{PeerAddress, PeerId};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::action::PeerHandle;

/// Default probe interval.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(300);

/// Asks a peer who it is.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Ping `target`. `None` if it did not answer.
    async fn ping(&self, target: &PeerHandle) -> Option<PeerId>;
}

/// Cleanup to run when a watched peer dies.
pub type Disposer = Box<dyn FnOnce() + Send + Sync>;

struct Watch {
    target: PeerHandle,
    disposers: HashMap<String, Disposer>,
    task: JoinHandle<()>,
}

struct Inner {
    interval: Duration,
    probe: Arc<dyn Probe>,
    watches: DashMap<PeerAddress, Watch>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for watch in self.watches.iter() {
            watch.task.abort();
        }
    }
}

/// Tracks which remote peers are still alive.
#[derive(Clone)]
pub struct Liveness {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Liveness")
            .field("interval", &self.inner.interval)
            .field("watched", &self.inner.watches.len())
            .finish_non_exhaustive()
    }
}

impl Liveness {
    /// Create a tracker probing through `probe` every `interval`.
    #[must_use]
    pub fn new(interval: Duration, probe: Arc<dyn Probe>) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval,
                probe,
                watches: DashMap::new(),
            }),
        }
    }

    /// The probe interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Watch `target`, running `disposer` under `key` if it dies.
    ///
    /// One probe task runs per address no matter how many disposers are
    /// attached. A disposer already held under `key` is replaced without
    /// running. Must be called from within a tokio runtime.
    pub fn watch(&self, target: PeerHandle, key: impl Into<String>, disposer: Disposer) {
        let key = key.into();
        match self.inner.watches.entry(target.address.clone()) {
            Entry::Occupied(mut entry) => {
                let watch = entry.get_mut();
                if watch.target.peer != target.peer {
                    debug!(address = %target.address, "watched peer changed identity");
                    watch.target = target;
                }
                watch.disposers.insert(key, disposer);
            },
            Entry::Vacant(entry) => {
                debug!(address = %target.address, peer = %target.peer, "watching peer");
                let task = tokio::spawn(probe_loop(
                    Arc::downgrade(&self.inner),
                    target.address.clone(),
                ));
                entry.insert(Watch {
                    target,
                    disposers: HashMap::from([(key, disposer)]),
                    task,
                });
            },
        }
    }

    /// Drop the disposer held under `key` for `address` without running it.
    ///
    /// The watch ends once no disposer is left. Returns whether a disposer
    /// was dropped.
    pub fn release(&self, address: &PeerAddress, key: &str) -> bool {
        let released = self
            .inner
            .watches
            .get_mut(address)
            .is_some_and(|mut watch| watch.disposers.remove(key).is_some());
        if let Some((_, watch)) = self
            .inner
            .watches
            .remove_if(address, |_, w| w.disposers.is_empty())
        {
            watch.task.abort();
            debug!(%address, "last registration released, peer unwatched");
        }
        released
    }

    /// Stop watching `address` without running its disposers.
    pub fn unwatch(&self, address: &PeerAddress) -> bool {
        match self.inner.watches.remove(address) {
            Some((_, watch)) => {
                watch.task.abort();
                debug!(%address, "peer unwatched");
                true
            },
            None => false,
        }
    }

    /// Whether `address` is watched and has not failed a probe.
    #[must_use]
    pub fn is_alive(&self, address: &PeerAddress) -> bool {
        self.inner.watches.contains_key(address)
    }

    /// Number of watched addresses.
    #[must_use]
    pub fn watched(&self) -> usize {
        self.inner.watches.len()
    }

    /// Number of disposers held for `address`.
    #[must_use]
    pub fn disposers(&self, address: &PeerAddress) -> usize {
        self.inner
            .watches
            .get(address)
            .map_or(0, |watch| watch.disposers.len())
    }
}

async fn probe_loop(inner: Weak<Inner>, address: PeerAddress) {
    let Some(period) = inner.upgrade().map(|i| i.interval) else {
        return;
    };
    let start = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let Some(target) = inner.watches.get(&address).map(|w| w.target.clone()) else {
            return;
        };

        let answer = inner.probe.ping(&target).await;
        if answer == Some(target.peer) {
            trace!(%address, "peer alive");
            continue;
        }

        warn!(
            %address,
            expected = %target.peer,
            answered = ?answer,
            "peer failed liveness probe, disposing its registrations"
        );
        if let Some((_, watch)) = inner
            .watches
            .remove_if(&address, |_, w| w.target.peer == target.peer)
        {
            for disposer in watch.disposers.into_values() {
                disposer();
            }
        }
        return;
    }
}
