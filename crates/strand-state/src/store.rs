//! The per-context state store.
//!
//! The hub context is authoritative: it owns persistence and grants write
//! leases. Every other context is dependent and reaches the hub through the
//! bus. Both sides keep one [`State`] per connected location, reference
//! counted per context.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use strand_bus::{ActionId, Bus, HandlerResult};
use strand_core::{KeyedMutex, Location, Queue, Value};
use strand_storage::{Record, RecordStore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connector::{self, ConnectOptions};
use crate::doc::{decode_update, encode_update};
use crate::error::{StateError, StateResult};
use crate::lease::{DEFAULT_LEASE_TIMEOUT, Leases};
use crate::model::ModelRegistry;
use crate::node::NodeMut;
use crate::state::{State, UPDATE};

/// Take the write lease on a location. Args: `[location]`.
/// Replies `{lease, doc}` with the full document as base64.
pub const LOCK: &str = "strand.state.lock";

/// Give a lease back. Args: `[location, lease]`. Replies with a bool.
pub const UNLOCK: &str = "strand.state.unlock";

/// Persisted locations under a parent. Args: `[parent]`.
pub const LIST: &str = "strand.state.list";

/// Delete a location and its record. Args: `[location]`.
pub const DESTROY: &str = "strand.state.destroy";

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// How long a dependent may hold a write lease.
    pub lease_timeout: Duration,
    /// Save after every change rather than only on disconnect.
    pub persist_on_commit: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            persist_on_commit: true,
        }
    }
}

type ConnectedCallback = Box<dyn FnOnce(State) + Send + Sync>;

enum Role {
    Authoritative {
        records: RecordStore,
        leases: Leases,
    },
    Dependent,
}

struct Slot {
    state: State,
    refs: usize,
    /// Opened for a dependent; stays open until destroyed.
    pinned: bool,
    /// Whether the upgrade has run in this context.
    upgraded: bool,
}

pub(crate) struct StoreInner {
    bus: Bus,
    role: Role,
    models: Arc<ModelRegistry>,
    settings: StoreSettings,
    connecting: KeyedMutex,
    states: DashMap<String, Slot>,
    defined: DashMap<String, ConnectOptions>,
    waiting: DashMap<String, Vec<ConnectedCallback>>,
    persistence: Queue,
    handlers: Mutex<Vec<(&'static str, ActionId)>>,
}

/// Connects, writes and removes state instances for one context.
///
/// Cloning is cheap; clones share the same instances.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("authoritative", &self.is_authoritative())
            .field("connected", &self.inner.states.len())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// The hub's store. Registers the lease, list and destroy actions.
    #[must_use]
    pub fn authoritative(
        bus: Bus,
        records: RecordStore,
        models: Arc<ModelRegistry>,
        settings: StoreSettings,
    ) -> Self {
        let leases = Leases::new(settings.lease_timeout);
        let store = Self::with_role(
            bus,
            Role::Authoritative { records, leases },
            models,
            settings,
        );
        store.register_hub_handlers();
        store
    }

    /// A store that defers to the hub for persistence and write leases.
    #[must_use]
    pub fn dependent(bus: Bus, models: Arc<ModelRegistry>, settings: StoreSettings) -> Self {
        Self::with_role(bus, Role::Dependent, models, settings)
    }

    fn with_role(
        bus: Bus,
        role: Role,
        models: Arc<ModelRegistry>,
        settings: StoreSettings,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                bus,
                role,
                models,
                settings,
                connecting: KeyedMutex::new(),
                states: DashMap::new(),
                defined: DashMap::new(),
                waiting: DashMap::new(),
                persistence: Queue::new(),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The bus this store talks over.
    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    /// Registered models.
    #[must_use]
    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.inner.models
    }

    /// Whether this store owns persistence.
    #[must_use]
    pub fn is_authoritative(&self) -> bool {
        self.inner.is_authoritative()
    }

    /// Options the hub uses when a dependent opens `location` first.
    pub fn define(&self, location: &Location, options: ConnectOptions) {
        self.inner.defined.insert(location.to_string(), options);
    }

    /// Connect to `location`, or return the instance already connected here.
    ///
    /// Concurrent calls for one location are serialized; setup runs once.
    ///
    /// # Errors
    ///
    /// Fails when loading, the hub round trip or a migration fails. The
    /// location is left unconnected and a later call starts over.
    pub async fn connect(&self, location: &Location, options: ConnectOptions) -> StateResult<State> {
        self.inner.open(location, Some(options), false).await
    }

    /// Release one handle. The last release tears the instance down and, on
    /// the hub, writes it to storage.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotConnected`] if nothing is connected there.
    pub async fn disconnect(&self, location: &Location) -> StateResult<()> {
        let key = location.to_string();
        let _guard = self.inner.connecting.lock(&key).await;
        let last = {
            let mut slot = self
                .inner
                .states
                .get_mut(&key)
                .ok_or_else(|| StateError::NotConnected(key.clone()))?;
            slot.refs = slot.refs.saturating_sub(1);
            slot.refs == 0 && !slot.pinned
        };
        if last && let Some((_, slot)) = self.inner.states.remove(&key) {
            self.inner.teardown(&slot.state, true).await?;
        }
        Ok(())
    }

    /// See [`State::transaction`].
    ///
    /// # Errors
    ///
    /// As [`State::transaction`].
    pub async fn transaction<F, R>(&self, state: &State, f: F) -> StateResult<R>
    where
        F: FnOnce(&mut NodeMut<'_>) -> StateResult<R> + Send,
        R: Send,
    {
        self.inner.transaction(state, f).await
    }

    /// Persisted locations directly under `parent`.
    ///
    /// # Errors
    ///
    /// Fails when storage or the hub round trip fails.
    pub async fn list(&self, parent: &Location) -> StateResult<Vec<Location>> {
        self.inner.list(parent).await
    }

    /// Tear `location` down and delete its record. Returns whether a record
    /// existed.
    ///
    /// # Errors
    ///
    /// Fails when storage or the hub round trip fails.
    pub async fn destroy(&self, location: &Location) -> StateResult<bool> {
        self.inner.destroy(location).await
    }

    /// Run `callback` once `location` is connected here; now if it already is.
    pub fn when_connected<F>(&self, location: &Location, callback: F)
    where
        F: FnOnce(State) + Send + Sync + 'static,
    {
        let key = location.to_string();
        let state = {
            let mut waiting = self.inner.waiting.entry(key.clone()).or_default();
            // Checked under the entry so a concurrent connect cannot slip by.
            if let Some(state) = self.get(location) {
                state
            } else {
                waiting.push(Box::new(callback));
                return;
            }
        };
        self.inner.waiting.remove_if(&key, |_, queued| queued.is_empty());
        callback(state);
    }

    /// The instance connected at `location`, if any.
    #[must_use]
    pub fn get(&self, location: &Location) -> Option<State> {
        self.inner
            .states
            .get(&location.to_string())
            .map(|slot| slot.state.clone())
    }

    /// Every connected location.
    #[must_use]
    pub fn connected(&self) -> Vec<Location> {
        let mut locations: Vec<Location> = self
            .inner
            .states
            .iter()
            .map(|slot| slot.state.location().clone())
            .collect();
        locations.sort_by_key(ToString::to_string);
        locations
    }

    /// Tear down every instance and unregister the hub actions.
    ///
    /// # Errors
    ///
    /// Returns the first failure to flush storage; every instance is still
    /// torn down.
    pub async fn close(&self) -> StateResult<()> {
        let handlers = std::mem::take(
            &mut *self
                .inner
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (name, id) in handlers {
            self.inner.bus.off(name, Some(id));
        }
        let keys: Vec<String> = self.inner.states.iter().map(|s| s.key().clone()).collect();
        let mut first_error = None;
        for key in keys {
            if let Some((_, slot)) = self.inner.states.remove(&key)
                && let Err(e) = self.inner.teardown(&slot.state, true).await
            {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn register_hub_handlers(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut ids = Vec::new();

        let store = weak.clone();
        ids.push((
            LOCK,
            self.inner.bus.on(LOCK, move |args| {
                let store = store.upgrade();
                async move {
                    match store {
                        Some(store) => store.handle_lock(&args).await,
                        None => Ok(None),
                    }
                }
            }),
        ));

        let store = weak.clone();
        ids.push((
            UNLOCK,
            self.inner.bus.on(UNLOCK, move |args| {
                let store = store.upgrade();
                async move {
                    match store {
                        Some(store) => store.handle_unlock(&args),
                        None => Ok(None),
                    }
                }
            }),
        ));

        let store = weak.clone();
        ids.push((
            LIST,
            self.inner.bus.on(LIST, move |args| {
                let store = store.upgrade();
                async move {
                    let Some(store) = store else {
                        return Ok(None);
                    };
                    let parent = location_arg(&args, 0)?;
                    let found = store.list(&parent).await?;
                    Ok(Some(Value::List(
                        found.iter().map(|l| Value::from(l.to_string())).collect(),
                    )))
                }
            }),
        ));

        let store = weak;
        ids.push((
            DESTROY,
            self.inner.bus.on(DESTROY, move |args| {
                let store = store.upgrade();
                async move {
                    let Some(store) = store else {
                        return Ok(None);
                    };
                    let location = location_arg(&args, 0)?;
                    Ok(Some(Value::Bool(store.destroy(&location).await?)))
                }
            }),
        ));

        *self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = ids;
    }
}

fn location_arg(args: &[Value], index: usize) -> StateResult<Location> {
    let text = args.get(index).and_then(Value::as_str).ok_or_else(|| {
        StateError::InvalidOperation(format!("argument {index} must be a location"))
    })?;
    Ok(text.parse()?)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

impl StoreInner {
    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    pub(crate) fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    pub(crate) fn is_authoritative(&self) -> bool {
        matches!(self.role, Role::Authoritative { .. })
    }

    async fn open(
        self: &Arc<Self>,
        location: &Location,
        options: Option<ConnectOptions>,
        pin: bool,
    ) -> StateResult<State> {
        let key = location.to_string();
        let _guard = self.connecting.lock(&key).await;

        let existing = self
            .states
            .get(&key)
            .map(|slot| (slot.state.clone(), slot.upgraded));
        if let Some((state, upgraded)) = existing {
            if !upgraded && let Some(options) = &options {
                self.late_upgrade(&state, options).await?;
            }
            if let Some(mut slot) = self.states.get_mut(&key) {
                if pin {
                    slot.pinned = true;
                } else {
                    slot.refs = slot.refs.saturating_add(1);
                }
                slot.upgraded |= options.is_some();
            }
            return Ok(state);
        }

        let state = connector::connect(self, location, options.as_ref()).await?;
        self.states.insert(
            key.clone(),
            Slot {
                state: state.clone(),
                refs: usize::from(!pin),
                pinned: pin,
                upgraded: options.is_some(),
            },
        );
        let callbacks = self
            .waiting
            .remove(&key)
            .map(|(_, callbacks)| callbacks)
            .unwrap_or_default();
        for callback in callbacks {
            callback(state.clone());
        }
        Ok(state)
    }

    /// Upgrade an instance the hub opened for a dependent before it knew the
    /// options.
    async fn late_upgrade(&self, state: &State, options: &ConnectOptions) -> StateResult<()> {
        let Role::Authoritative { leases, .. } = &self.role else {
            return Ok(());
        };
        let _lease = leases.local(&state.location().to_string()).await;
        if let Some(update) = state.upgrade_with(options)? {
            self.persist(state, false);
            self.broadcast(state.location(), &update).await;
        }
        Ok(())
    }

    async fn teardown(&self, state: &State, save: bool) -> StateResult<()> {
        state.shutdown(&self.bus);
        if self.is_authoritative() {
            if save {
                self.persist(state, true);
            }
            self.persistence.flush(&state.location().to_string()).await?;
        }
        Ok(())
    }

    pub(crate) async fn transaction<F, R>(&self, state: &State, f: F) -> StateResult<R>
    where
        F: FnOnce(&mut NodeMut<'_>) -> StateResult<R> + Send,
        R: Send,
    {
        let location = state.location();
        if !state.is_connected() {
            return Err(StateError::NotConnected(location.to_string()));
        }
        match &self.role {
            Role::Authoritative { leases, .. } => {
                let _lease = leases.local(&location.to_string()).await;
                let (output, update) = state.apply_local(None, f)?;
                if let Some(update) = update {
                    self.persist(state, false);
                    self.broadcast(location, &update).await;
                }
                Ok(output)
            },
            Role::Dependent => {
                let (lease, doc) = self.lock_remote(location).await?;
                let outcome = state.apply_local(Some(&doc), f);
                let pushed = match &outcome {
                    Ok((_, Some(update))) => self.push_update(location, update).await,
                    _ => Ok(()),
                };
                self.unlock_remote(location, &lease).await;
                pushed?;
                outcome.map(|(output, _)| output)
            },
        }
    }

    async fn list(&self, parent: &Location) -> StateResult<Vec<Location>> {
        match &self.role {
            Role::Authoritative { records, .. } => {
                let pending: Vec<String> = self
                    .states
                    .iter()
                    .filter(|slot| slot.state.location().starts_with(parent))
                    .map(|slot| slot.key().clone())
                    .collect();
                for key in pending {
                    self.persistence.flush(&key).await?;
                }
                Ok(records.list(parent).await?)
            },
            Role::Dependent => {
                let reply = self
                    .bus
                    .send(LIST, vec![Value::from(parent.to_string())])
                    .await?
                    .ok_or_else(|| StateError::Unavailable(LIST.to_owned()))?;
                reply
                    .as_list()
                    .unwrap_or_default()
                    .iter()
                    .map(|item| {
                        location_arg(std::slice::from_ref(item), 0)
                    })
                    .collect()
            },
        }
    }

    async fn destroy(&self, location: &Location) -> StateResult<bool> {
        let key = location.to_string();
        let existed = match &self.role {
            Role::Authoritative { records, leases } => {
                let _guard = self.connecting.lock(&key).await;
                if let Some((_, slot)) = self.states.remove(&key) {
                    self.teardown(&slot.state, false).await?;
                }
                let revoked = leases.revoke(&key);
                self.persistence.flush(&key).await?;
                let existed = records.delete(location).await?;
                debug!(location = %key, revoked, "record deleted");
                existed
            },
            Role::Dependent => {
                let reply = self
                    .bus
                    .send(DESTROY, vec![Value::from(key.clone())])
                    .await?
                    .ok_or_else(|| StateError::Unavailable(DESTROY.to_owned()))?;
                let _guard = self.connecting.lock(&key).await;
                if let Some((_, slot)) = self.states.remove(&key) {
                    self.teardown(&slot.state, false).await?;
                }
                reply.as_bool().unwrap_or(false)
            },
        };
        info!(location = %key, existed, "state destroyed");
        Ok(existed)
    }

    // -----------------------------------------------------------------------
    // Persistence (hub)
    // -----------------------------------------------------------------------

    /// Load the stored record once pending saves for it have landed.
    pub(crate) async fn load_record(&self, location: &Location) -> StateResult<Option<Record>> {
        let Role::Authoritative { records, .. } = &self.role else {
            return Ok(None);
        };
        self.persistence.flush(&location.to_string()).await?;
        Ok(records.load(location).await?)
    }

    /// Queue a save of `state` as it is now.
    pub(crate) fn persist(&self, state: &State, force: bool) {
        let Role::Authoritative { records, .. } = &self.role else {
            return;
        };
        if !force && !self.settings.persist_on_commit {
            return;
        }
        let record = match state.record() {
            Ok(record) => record,
            Err(e) => {
                error!(location = %state.location(), error = %e, "state could not be flattened");
                return;
            },
        };
        let records = records.clone();
        let location = state.location().clone();
        self.persistence.push(&location.to_string(), async move {
            if let Err(e) = records.save(&location, &record).await {
                error!(location = %location, error = %e, "state save failed");
            }
        });
    }

    /// Send a hub-made update to every dependent holding the location.
    async fn broadcast(&self, location: &Location, update: &[u8]) {
        let name = self.bus.scoped(location.to_string()).name(UPDATE);
        let args = vec![encode_update(update), Value::from(self.bus.peer_id().to_string())];
        if let Err(e) = self.bus.send(name, args).await {
            warn!(location = %location, error = %e, "update broadcast failed");
        }
    }

    // -----------------------------------------------------------------------
    // Hub round trips (dependent)
    // -----------------------------------------------------------------------

    /// Take the write lease. Returns the lease id and the hub's document.
    pub(crate) async fn lock_remote(&self, location: &Location) -> StateResult<(String, Vec<u8>)> {
        let reply = self
            .bus
            .send(LOCK, vec![Value::from(location.to_string())])
            .await?
            .ok_or_else(|| StateError::Unavailable(location.to_string()))?;
        let lease = reply
            .get("lease")
            .and_then(Value::as_str)
            .ok_or_else(|| StateError::InvalidOperation("lock reply without lease".into()))?
            .to_owned();
        let doc = decode_update(reply.get("doc").unwrap_or(&Value::Null))?;
        Ok((lease, doc))
    }

    pub(crate) async fn unlock_remote(&self, location: &Location, lease: &str) {
        let args = vec![Value::from(location.to_string()), Value::from(lease)];
        match self.bus.send(UNLOCK, args).await {
            Ok(Some(Value::Bool(true))) => {},
            Ok(_) => warn!(location = %location, lease, "lease was no longer held"),
            Err(e) => warn!(location = %location, lease, error = %e, "lease release failed"),
        }
    }

    /// Hand a local update to the hub and wait for its acknowledgement.
    pub(crate) async fn push_update(&self, location: &Location, update: &[u8]) -> StateResult<()> {
        let name = self.bus.scoped(location.to_string()).name(UPDATE);
        let args = vec![encode_update(update), Value::from(self.bus.peer_id().to_string())];
        match self.bus.send(name, args).await? {
            Some(_) => Ok(()),
            None => Err(StateError::Unavailable(location.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Hub actions
    // -----------------------------------------------------------------------

    async fn handle_lock(self: &Arc<Self>, args: &[Value]) -> HandlerResult {
        let Role::Authoritative { leases, .. } = &self.role else {
            return Ok(None);
        };
        let location = location_arg(args, 0)?;
        let key = location.to_string();
        let options = self.defined.get(&key).map(|entry| entry.value().clone());
        let state = self.open(&location, options, true).await?;
        let lease = leases.acquire(&key).await;
        let doc = state.save();
        Ok(Some(Value::from_iter([
            ("lease", Value::from(lease.to_string())),
            ("doc", encode_update(&doc)),
        ])))
    }

    fn handle_unlock(&self, args: &[Value]) -> HandlerResult {
        let Role::Authoritative { leases, .. } = &self.role else {
            return Ok(None);
        };
        let released = args
            .get(1)
            .and_then(Value::as_str)
            .and_then(|text| Uuid::parse_str(text).ok())
            .is_some_and(|id| leases.release(id));
        Ok(Some(Value::Bool(released)))
    }
}
