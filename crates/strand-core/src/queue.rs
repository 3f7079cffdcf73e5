//! Per-key ordering primitives.
//!
//! Two flavours share one idea, "one thing at a time per key":
//!
//! - [`KeyedMutex`] hands out a guard per key. Waiters are served in the
//!   order they started waiting. Used for the per-location connect mutex.
//! - [`Queue`] is a fire-and-forget task runner. Tasks pushed for the same key
//!   run strictly one after another in the order they were pushed, even
//!   when the caller does not await them.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};
use tracing::{trace, warn};

use crate::error::{CoreError, CoreResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A set of named async mutexes, created on demand.
#[derive(Debug, Clone, Default)]
pub struct KeyedMutex {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    /// Create an empty mutex set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = Arc::clone(self.locks.entry(key.to_owned()).or_default().value());
        let guard = mutex.lock_owned().await;
        trace!(key, "keyed mutex acquired");
        KeyedGuard {
            key: key.to_owned(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Whether `key` is currently held.
    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    /// Number of keys with a live mutex.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key has a live mutex.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key of a [`KeyedMutex`]. Released on drop.
#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedGuard {
    /// The key this guard holds.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so a count of one means nobody else
        // is queued on this key and the entry can go.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!(key = %self.key, "keyed mutex released");
    }
}

/// Strictly ordered async task runner, one lane per key.
///
/// A lane lives while it has work: once its last task finishes and nothing
/// else is queued, it removes itself.
#[derive(Debug, Clone, Default)]
pub struct Queue {
    lanes: Arc<DashMap<String, Lane>>,
    next_lane: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Lane {
    id: u64,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Queue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `task` on the lane for `key` without waiting for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push<F>(&self, key: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Sent under the entry lock so a draining lane cannot retire between
        // the lookup and the send.
        let sent = {
            let lane = self.lanes.entry(key.to_owned()).or_insert_with(|| {
                let id = self.next_lane.fetch_add(1, Ordering::Relaxed);
                Lane {
                    id,
                    jobs: spawn_lane(key, id, Arc::downgrade(&self.lanes)),
                }
            });
            lane.jobs.send(Box::pin(task))
        };
        if let Err(mpsc::error::SendError(job)) = sent {
            warn!(key, "queue lane closed, running task detached");
            self.lanes.remove(key);
            tokio::spawn(job);
        }
    }

    /// Enqueue `task` on the lane for `key` and wait for its output.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::QueueClosed`] if the task panicked or the
    /// runtime shut down before it ran.
    pub async fn run<F, T>(&self, key: &str, task: F) -> CoreResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.push(key, async move {
            let _ = tx.send(task.await);
        });
        rx.await.map_err(|_| CoreError::QueueClosed(key.to_owned()))
    }

    /// Wait until every task pushed for `key` before this call has finished.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::QueueClosed`] if the lane is gone.
    pub async fn flush(&self, key: &str) -> CoreResult<()> {
        self.run(key, async {}).await
    }

    /// Number of lanes with queued or running work.
    #[must_use]
    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }
}

fn spawn_lane(
    key: &str,
    id: u64,
    lanes: Weak<DashMap<String, Lane>>,
) -> mpsc::UnboundedSender<Job> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let key = key.to_owned();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            // Each job runs in its own task so a panic does not take the lane down.
            if let Err(e) = tokio::spawn(job).await {
                warn!(key = %key, error = %e, "queued task failed");
            }
            let Some(lanes) = lanes.upgrade() else {
                break;
            };
            if lanes
                .remove_if(&key, |_, lane| lane.id == id && rx.is_empty())
                .is_some()
            {
                trace!(key = %key, "queue lane drained");
                return;
            }
        }
        trace!(key = %key, "queue lane closed");
    });
    tx
}
