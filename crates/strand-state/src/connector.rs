//! Bringing a location from unconnected to ready.
//!
//! The connect mutex for the location is held by the caller. While it is
//! held the connector starts listening for remote updates (buffering them),
//! loads the document, applies the buffer, runs the upgrade and only then
//! lets updates flow straight into the new instance.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use automerge::{ObjId, ROOT};
use strand_bus::{ActionId, HandlerResult};
use strand_core::{Location, Value};
use tracing::{debug, error, info};

use crate::doc::decode_update;
use crate::error::{StateError, StateResult};
use crate::model::is_reserved;
use crate::node::Graph;
use crate::state::{State, StateInner, UPDATE};
use crate::store::StoreInner;
use crate::versioner::Versioner;

/// Produces the contents of a location that has never been written.
pub type InitialFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// How a location is brought up.
#[derive(Clone)]
pub struct ConnectOptions {
    initial: InitialFn,
    versioner: Versioner,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            initial: Arc::new(Value::map),
            versioner: Versioner::new(),
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("versioner", &self.versioner)
            .finish_non_exhaustive()
    }
}

impl ConnectOptions {
    /// Empty initial value, no migrations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents for a location that has never been written. Must be a map.
    #[must_use]
    pub fn initial<F>(mut self, initial: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.initial = Arc::new(initial);
        self
    }

    /// Root migrations.
    #[must_use]
    pub fn versioner(mut self, versioner: Versioner) -> Self {
        self.versioner = versioner;
        self
    }

    /// Root migrations.
    #[must_use]
    pub fn migrations(&self) -> &Versioner {
        &self.versioner
    }
}

// ---------------------------------------------------------------------------
// Upgrade
// ---------------------------------------------------------------------------

/// Seed a blank instance or migrate a stored one, then its nested models.
pub(crate) fn upgrade(graph: &mut Graph, options: &ConnectOptions) -> StateResult<()> {
    let stored = graph.version_of(&ROOT);
    if stored.is_none() && graph.is_blank() {
        let map = match (options.initial)() {
            Value::Map(map) => map,
            other => {
                return Err(StateError::InvalidOperation(format!(
                    "initial value for {} is a {}, not a map",
                    graph.location(),
                    other.type_name()
                )));
            },
        };
        let mut root = graph.root_mut();
        for (key, value) in map {
            if !is_reserved(&key) {
                root.set(&key, value)?;
            }
        }
        let latest = options.versioner.latest();
        graph.stamp(&ROOT, latest)?;
        debug!(location = %graph.location(), version = latest, "initial value applied");
    } else {
        pin_unversioned(graph)?;
        let current = stored.unwrap_or(0);
        migrate(graph, &ROOT, &options.versioner, current)?;
        if stored.is_none() {
            graph.stamp(&ROOT, options.versioner.latest().max(current))?;
        }
    }

    // Collected after the root steps: they may have moved or rebuilt
    // instances into new objects.
    for (obj, name) in graph.model_objects() {
        let Some(descriptor) = graph.models().get(&name) else {
            continue;
        };
        let current = graph.version_of(&obj).unwrap_or(0);
        migrate(graph, &obj, descriptor.migrations(), current)?;
    }
    Ok(())
}

/// Stamp version 0 on stored instances that have migrations but no version.
///
/// A root step that moves such an instance writes it back through
/// [`NodeMut::set`](crate::NodeMut::set), which stamps the latest version on
/// anything arriving without one.
fn pin_unversioned(graph: &mut Graph) -> StateResult<()> {
    for (obj, name) in graph.model_objects() {
        let versioned = graph
            .models()
            .get(&name)
            .is_some_and(|descriptor| !descriptor.migrations().is_empty());
        if versioned && graph.version_of(&obj).is_none() {
            graph.stamp(&obj, 0)?;
        }
    }
    Ok(())
}

/// Run every step above `current` on `obj`, stamping after each.
fn migrate(graph: &mut Graph, obj: &ObjId, versioner: &Versioner, current: u64) -> StateResult<()> {
    for (version, step) in versioner.pending(current) {
        let before = graph.detached(obj)?;
        let mut after = before.clone();
        step(&mut after).map_err(|e| StateError::Migration {
            version,
            message: e.to_string(),
        })?;

        let mut node = graph.node_mut(obj.clone());
        for key in before.keys().filter(|key| !after.contains_key(*key)) {
            node.remove(key)?;
        }
        for (key, value) in after {
            if !is_reserved(&key) && before.get(&key) != Some(&value) {
                node.set(&key, value)?;
            }
        }
        graph.stamp(obj, version)?;
        info!(location = %graph.location(), version, "migration applied");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Inbound updates
// ---------------------------------------------------------------------------

/// Where remote updates for a connecting location go.
enum Inbound {
    /// Not ready yet; kept in arrival order.
    Buffering(Vec<Vec<u8>>),
    /// Straight into the instance.
    Live(Weak<StateInner>),
}

type SharedInbound = Arc<Mutex<Inbound>>;

fn receive(
    inbound: &SharedInbound,
    store: &Weak<StoreInner>,
    own: &str,
    authoritative: bool,
    args: &[Value],
) -> HandlerResult {
    let ack = authoritative.then_some(Value::Bool(true));
    if args.get(1).and_then(Value::as_str) == Some(own) {
        return Ok(None);
    }
    let update = decode_update(args.first().unwrap_or(&Value::Null))?;

    let live = {
        let mut inbound = inbound.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *inbound {
            Inbound::Buffering(pending) => {
                pending.push(update);
                return Ok(ack);
            },
            Inbound::Live(state) => state.clone(),
        }
    };
    let Some(state) = State::from_weak(&live) else {
        return Ok(None);
    };
    state.apply_update(&update)?;
    if authoritative && let Some(store) = store.upgrade() {
        store.persist(&state, false);
    }
    Ok(ack)
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

/// Bring `location` up. The caller holds the location's connect mutex.
///
/// `options` is `None` only when the hub opens a location on a dependent's
/// behalf without a local definition; the upgrade is then left to the
/// dependent, which runs it under the write lease.
pub(crate) async fn connect(
    store: &Arc<StoreInner>,
    location: &Location,
    options: Option<&ConnectOptions>,
) -> StateResult<State> {
    let scope = store.bus().scoped(location.to_string());
    let inbound: SharedInbound = Arc::new(Mutex::new(Inbound::Buffering(Vec::new())));
    let authoritative = store.is_authoritative();
    let own = store.bus().peer_id().to_string();
    let listener = {
        let inbound = Arc::clone(&inbound);
        let weak = Arc::downgrade(store);
        scope.on(UPDATE, move |args| {
            std::future::ready(receive(&inbound, &weak, &own, authoritative, &args))
        })
    };

    let mut lease = None;
    let result = bring_up(store, location, options, &inbound, listener, &mut lease).await;
    if let Some(lease) = lease {
        store.unlock_remote(location, &lease).await;
    }
    match result {
        Ok(state) => {
            info!(location = %location, version = ?state.version(), authoritative, "state connected");
            Ok(state)
        },
        Err(e) => {
            scope.off(UPDATE, Some(listener));
            error!(location = %location, error = %e, "state connect failed");
            Err(e)
        },
    }
}

async fn bring_up(
    store: &Arc<StoreInner>,
    location: &Location,
    options: Option<&ConnectOptions>,
    inbound: &SharedInbound,
    listener: ActionId,
    lease: &mut Option<String>,
) -> StateResult<State> {
    let mut graph = if store.is_authoritative() {
        let record = store.load_record(location).await?;
        let mut graph = Graph::new(location.clone(), Arc::clone(store.models()));
        if let Some(record) = record {
            graph.hydrate(&record)?;
        }
        graph
    } else {
        store.bus().settle().await;
        let (id, doc) = store.lock_remote(location).await?;
        *lease = Some(id);
        Graph::load(&doc, location.clone(), Arc::clone(store.models()))?
    };

    let buffered = {
        let mut inbound = inbound.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *inbound {
            Inbound::Buffering(pending) => std::mem::take(pending),
            Inbound::Live(_) => Vec::new(),
        }
    };
    for update in &buffered {
        graph.apply_remote(update)?;
    }
    if !buffered.is_empty() {
        debug!(location = %location, count = buffered.len(), "buffered updates applied");
    }

    if let Some(options) = options {
        upgrade(&mut graph, options)?;
    }
    let update = graph.commit();
    let calls = graph.reconcile()?;
    let state = State::new(graph, Arc::downgrade(store), listener);

    let late = {
        let mut inbound = inbound.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *inbound, Inbound::Live(state.downgrade())) {
            Inbound::Buffering(pending) => pending,
            Inbound::Live(_) => Vec::new(),
        }
    };
    for update in &late {
        state.apply_update(update)?;
    }

    if store.is_authoritative() {
        store.persist(&state, true);
    } else if let Some(update) = update {
        store.push_update(location, &update).await?;
    }

    for call in &calls {
        call.run(location);
    }
    Ok(state)
}
