//! A connected state instance.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use strand_bus::{ActionId, Bus};
use strand_core::{Location, Value};
use strand_storage::Record;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::connector::{ConnectOptions, upgrade};
use crate::error::{StateError, StateResult};
use crate::node::{Graph, HookCall, NodeMut, NodeRef};
use crate::store::StoreInner;

/// Name of the per-location update action inside the location's scope.
pub const UPDATE: &str = "update";

pub(crate) struct StateInner {
    location: Location,
    graph: Mutex<Graph>,
    revision: watch::Sender<u64>,
    connected: AtomicBool,
    store: Weak<StoreInner>,
    listener: Mutex<Option<ActionId>>,
}

/// Handle to one connected location.
///
/// Reads see the document as of the last committed transaction or applied
/// remote update. Writes go through [`transaction`](Self::transaction).
/// Cloning is cheap; clones share the instance.
#[derive(Clone)]
pub struct State {
    inner: Arc<StateInner>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("location", &self.inner.location)
            .field("revision", &self.revision())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl State {
    pub(crate) fn new(graph: Graph, store: Weak<StoreInner>, listener: ActionId) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(StateInner {
                location: graph.location().clone(),
                graph: Mutex::new(graph),
                revision,
                connected: AtomicBool::new(true),
                store,
                listener: Mutex::new(Some(listener)),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<StateInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_weak(inner: &Weak<StateInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    fn graph(&self) -> MutexGuard<'_, Graph> {
        self.inner
            .graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The location this instance lives at.
    #[must_use]
    pub fn location(&self) -> &Location {
        &self.inner.location
    }

    /// Run `f` against the root node.
    pub fn read<R>(&self, f: impl FnOnce(NodeRef<'_>) -> R) -> R {
        f(self.graph().root())
    }

    /// The whole instance as plain data.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Crdt`] if the document cannot be read.
    pub fn snapshot(&self) -> StateResult<Value> {
        self.graph().data()
    }

    /// Plain value under a root key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read(|root| root.get(key))
    }

    /// Stored schema version of the root.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.read(|root| root.version())
    }

    /// Watch the revision counter. It moves once per committed change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Current revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    /// Whether this handle still belongs to a live connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether two handles point at the same instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Apply every write in `f` as one change.
    ///
    /// Observers see either none or all of the writes. On a dependent
    /// context the authoritative document is merged first and the write
    /// lease is held until the hub has the update, so concurrent
    /// transactions from different contexts never lose each other's writes.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, with its writes rolled back, or
    /// [`StateError::NotConnected`] / [`StateError::Unavailable`] when the
    /// instance or the hub is gone.
    pub async fn transaction<F, R>(&self, f: F) -> StateResult<R>
    where
        F: FnOnce(&mut NodeMut<'_>) -> StateResult<R> + Send,
        R: Send,
    {
        let store = self
            .inner
            .store
            .upgrade()
            .ok_or_else(|| StateError::NotConnected(self.location().to_string()))?;
        store.transaction(self, f).await
    }

    // -----------------------------------------------------------------------
    // Engine side
    // -----------------------------------------------------------------------

    pub(crate) fn record(&self) -> StateResult<Record> {
        self.graph().record()
    }

    /// Full document for a context about to write.
    pub(crate) fn save(&self) -> Vec<u8> {
        self.graph().save()
    }

    /// Merge an update that originated elsewhere.
    pub(crate) fn apply_update(&self, update: &[u8]) -> StateResult<()> {
        let calls = {
            let mut graph = self.graph();
            graph.apply_remote(update)?;
            graph.reconcile()?
        };
        self.after_change(&calls);
        Ok(())
    }

    /// Merge `base` if given, run `f` on the root and commit.
    ///
    /// Returns `f`'s output and the update to send out, if anything changed.
    /// With a `base` the update carries every local change the base lacks,
    /// including earlier ones that never reached it.
    pub(crate) fn apply_local<F, R>(
        &self,
        base: Option<&[u8]>,
        f: F,
    ) -> StateResult<(R, Option<Vec<u8>>)>
    where
        F: FnOnce(&mut NodeMut<'_>) -> StateResult<R>,
    {
        let (outcome, calls, changed) = {
            let mut graph = self.graph();
            let base_heads = base.map(|base| graph.merge_base(base)).transpose()?;
            let outcome = f(&mut graph.root_mut());
            let update = if outcome.is_ok() {
                let committed = graph.commit();
                match &base_heads {
                    Some(heads) => graph.changes_after(heads),
                    None => committed,
                }
            } else {
                graph.rollback()?;
                None
            };
            let calls = graph.reconcile()?;
            let changed = base.is_some() || update.is_some();
            (outcome.map(|value| (value, update)), calls, changed)
        };
        if changed {
            self.after_change(&calls);
        }
        if let Err(e) = &outcome {
            debug!(location = %self.location(), error = %e, "transaction rolled back");
        }
        outcome
    }

    /// Run the upgrade on an instance opened without options.
    pub(crate) fn upgrade_with(&self, options: &ConnectOptions) -> StateResult<Option<Vec<u8>>> {
        let (update, calls) = {
            let mut graph = self.graph();
            if let Err(e) = upgrade(&mut graph, options) {
                graph.rollback()?;
                return Err(e);
            }
            let update = graph.commit();
            (update, graph.reconcile()?)
        };
        if update.is_some() {
            self.after_change(&calls);
        }
        Ok(update)
    }

    fn after_change(&self, calls: &[HookCall]) {
        for call in calls {
            call.run(self.location());
        }
        self.inner
            .revision
            .send_modify(|revision| *revision = revision.wrapping_add(1));
        trace!(location = %self.location(), revision = self.revision(), "state changed");
    }

    /// Stop listening and run cleanup hooks. Reads keep working.
    pub(crate) fn shutdown(&self, bus: &Bus) {
        self.inner.connected.store(false, Ordering::SeqCst);
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = listener {
            bus.scoped(self.location().to_string()).off(UPDATE, Some(id));
        }
        let calls = self.graph().teardown();
        for call in &calls {
            call.run(self.location());
        }
        debug!(location = %self.location(), "state disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelRegistry;
    use crate::node::NodeKind;

    fn state() -> State {
        let graph = Graph::new("p/s/x".parse().unwrap(), Arc::new(ModelRegistry::new()));
        State::new(graph, Weak::new(), ActionId::new())
    }

    #[test]
    fn test_local_change_bumps_revision_once() {
        let state = state();
        let mut rx = state.subscribe();
        let ((), update) = state
            .apply_local(None, |root| {
                root.set("a", 1)?;
                root.set("b", 2)?;
                Ok(())
            })
            .unwrap();
        assert!(update.is_some());
        assert_eq!(state.revision(), 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            state.snapshot().unwrap(),
            Value::from_iter([("a", 1), ("b", 2)])
        );
    }

    #[test]
    fn test_failed_change_is_invisible() {
        let state = state();
        let err = state
            .apply_local(None, |root| {
                root.set("a", 1)?;
                root.push(2)
            })
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidOperation(_)));
        assert_eq!(state.revision(), 0);
        assert_eq!(state.get("a"), None);
    }

    #[test]
    fn test_remote_update_applies() {
        let writer = state();
        let (_, update) = writer
            .apply_local(None, |root| root.set("list", Value::List(vec![1.into()])))
            .unwrap();

        let reader = state();
        reader.apply_update(&update.unwrap()).unwrap();
        assert_eq!(reader.revision(), 1);
        assert_eq!(reader.read(|root| root.child("list").unwrap().kind()), NodeKind::List);
    }

    #[tokio::test]
    async fn test_transaction_without_store_is_not_connected() {
        let state = state();
        let result = state.transaction(|root| root.set("a", 1)).await;
        assert!(matches!(result, Err(StateError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_shutdown_marks_disconnected() {
        let state = state();
        state.shutdown(&Bus::local());
        assert!(!state.is_connected());
        assert_eq!(state.snapshot().unwrap(), Value::map());
    }

    #[test]
    fn test_update_against_base_resends_unacknowledged_changes() {
        let hub = state();
        let _ = hub.apply_local(None, |root| root.set("n", 0)).unwrap();
        let dependent = state();

        let ((), lost) = dependent
            .apply_local(Some(&hub.save()), |root| root.set("a", 1))
            .unwrap();
        assert!(lost.is_some());

        // Nothing new written, but the hub still lacks `a`.
        let ((), backlog) = dependent.apply_local(Some(&hub.save()), |_| Ok(())).unwrap();
        assert!(backlog.is_some());

        let ((), update) = dependent
            .apply_local(Some(&hub.save()), |root| root.set("b", 2))
            .unwrap();
        hub.apply_update(&update.unwrap()).unwrap();
        assert_eq!(
            hub.snapshot().unwrap(),
            Value::from_iter([("n", 0), ("a", 1), ("b", 2)])
        );

        let ((), settled) = dependent.apply_local(Some(&hub.save()), |_| Ok(())).unwrap();
        assert!(settled.is_none());
    }

    #[test]
    fn test_state_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<State>();
    }
}
