//! The bus: named actions reachable from every context.

use std::future::Future;
use std::panic::Location as CallSite;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::FuturesUnordered;
use serde_json::Value as Json;
use strand_core::{PeerAddress, PeerId, Queue, Value};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::action::{
    Action, ActionId, ActionRegistry, Handler, HandlerResult, PeerHandle, Scope, handler_fn,
};
use crate::bridge::{BusProbe, Links, LinkInbox, Route};
use crate::envelope::{Envelope, PROXY_OFF, PROXY_ON, PROXY_RESET, SIGNAL_PREFIX};
use crate::error::{BusError, BusResult};
use crate::liveness::{DEFAULT_LIVENESS_INTERVAL, Liveness};
use crate::scoped::ScopedBus;
use crate::serializer::{DEFAULT_BLOB_IDLE_TIMEOUT, Serializer};
use crate::transport::{ExtensionPort, PagePort};

/// Queue lane carrying proxy announcements to the upstream context.
const ANNOUNCE_LANE: &str = "announce";

type Branch = BoxFuture<'static, BusResult<Option<Value>>>;

pub(crate) struct BusInner {
    pub(crate) peer: PeerId,
    pub(crate) address: PeerAddress,
    pub(crate) registry: ActionRegistry,
    pub(crate) serializer: Serializer,
    pub(crate) links: Links,
    pub(crate) liveness: Liveness,
    announcements: Queue,
    signals: DashMap<String, ActionId>,
}

impl BusInner {
    pub(crate) fn add_local(self: &Arc<Self>, id: ActionId, name: String, handler: Handler) {
        let announce = self.registry.insert(Action::local(id, name.clone(), handler));
        if announce {
            self.announce(PROXY_ON, &name);
        }
    }

    pub(crate) fn remove_local(self: &Arc<Self>, name: &str, id: Option<ActionId>) -> usize {
        let removal = self.registry.remove_local(name, id);
        if removal.now_absent {
            self.announce(PROXY_OFF, name);
        }
        removal.removed
    }

    pub(crate) fn add_proxy(self: &Arc<Self>, name: &str, target: PeerHandle, handler: Handler) {
        let announce = self
            .registry
            .insert(Action::proxy(name, target.clone(), handler));

        let bus = Arc::downgrade(self);
        let owned_name = name.to_owned();
        let address = target.address.clone();
        self.liveness.watch(
            target,
            name,
            Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.remove_proxy(&owned_name, &address);
                }
            }),
        );

        if announce {
            self.announce(PROXY_ON, name);
        }
    }

    pub(crate) fn remove_proxy(self: &Arc<Self>, name: &str, address: &PeerAddress) {
        self.liveness.release(address, name);
        if self.registry.remove_proxy(name, address).now_absent {
            self.announce(PROXY_OFF, name);
        }
    }

    /// Drop everything a restarted downstream context registered.
    pub(crate) fn reset_peer(self: &Arc<Self>, address: &PeerAddress) {
        self.liveness.unwatch(address);
        let emptied = self.registry.remove_proxies_to(address);
        debug!(%address, retracted = emptied.len(), "downstream peer reset");
        for name in emptied {
            self.announce(PROXY_OFF, &name);
        }
    }

    /// Queue an announcement to the upstream context, if there is one.
    pub(crate) fn announce(self: &Arc<Self>, kind: &'static str, name: &str) {
        let Some(via) = self.links.upstream() else {
            return;
        };
        let bus = Arc::downgrade(self);
        let args = if kind == PROXY_RESET {
            Vec::new()
        } else {
            vec![Json::String(name.to_owned())]
        };
        let name = name.to_owned();
        self.announcements.push(ANNOUNCE_LANE, async move {
            let Some(bus) = bus.upgrade() else {
                return;
            };
            let payload = match Envelope::new(kind, args, bus.peer).encode() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(kind, name = %name, error = %e, "could not encode announcement");
                    return;
                },
            };
            trace!(kind, name = %name, "announcing upstream");
            if let Err(e) = bus.links.request(via, None, payload).await {
                warn!(kind, name = %name, error = %e, "announcement not delivered");
            }
        });
    }

    /// Wait until queued announcements reached the upstream context.
    pub(crate) async fn settle(&self) {
        if let Err(e) = self.announcements.flush(ANNOUNCE_LANE).await {
            warn!(error = %e, "announcement queue closed");
        }
    }

    /// Spawn every matching local action as its own task.
    fn local_branches(
        &self,
        name: &str,
        args: &[Value],
        scope: Scope<'_>,
        site: &'static CallSite<'static>,
    ) -> Vec<Branch> {
        self.registry
            .matching(name, scope)
            .into_iter()
            .map(|action| {
                let task = tokio::spawn((action.handler)(args.to_vec()));
                let name = name.to_owned();
                async move {
                    match task.await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(BusError::Handler {
                            name,
                            message: e.message().to_owned(),
                            site,
                        }),
                        Err(e) => Err(BusError::Handler {
                            name,
                            message: format!("handler aborted: {e}"),
                            site,
                        }),
                    }
                }
                .boxed()
            })
            .collect()
    }

    /// Spawn the request to the upstream context.
    fn upstream_branch(
        self: &Arc<Self>,
        name: &str,
        args: &[Value],
        site: &'static CallSite<'static>,
    ) -> Option<Branch> {
        let via = self.links.upstream()?;
        let bus = Arc::clone(self);
        let name = name.to_owned();
        let args = args.to_vec();
        let task = tokio::spawn(async move {
            bus.call(&Route::upstream(via), &name, &args, site).await
        });
        Some(
            async move {
                task.await.unwrap_or_else(|e| {
                    warn!(error = %e, "upstream request aborted");
                    Ok(None)
                })
            }
            .boxed(),
        )
    }

    /// Local actions (within `scope`) raced against the upstream context.
    pub(crate) async fn route_send(
        self: &Arc<Self>,
        name: &str,
        args: Vec<Value>,
        scope: Scope<'_>,
        site: &'static CallSite<'static>,
    ) -> BusResult<Option<Value>> {
        let mut branches = self.local_branches(name, &args, scope, site);
        branches.extend(self.upstream_branch(name, &args, site));
        trace!(name, branches = branches.len(), "send");
        race(branches).await
    }

    /// Local actions (within `scope`) only.
    pub(crate) async fn dispatch(
        &self,
        name: &str,
        args: Vec<Value>,
        scope: Scope<'_>,
        site: &'static CallSite<'static>,
    ) -> BusResult<Option<Value>> {
        let branches = self.local_branches(name, &args, scope, site);
        trace!(name, branches = branches.len(), "dispatch");
        race(branches).await
    }
}

/// First value wins; failing that the first error; failing that `None`.
///
/// Branches are spawned tasks, so returning early leaves the rest running.
async fn race(branches: Vec<Branch>) -> BusResult<Option<Value>> {
    let mut pending: FuturesUnordered<Branch> = branches.into_iter().collect();
    let mut first_error = None;
    while let Some(outcome) = pending.next().await {
        match outcome {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {},
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            },
        }
    }
    first_error.map_or(Ok(None), Err)
}

/// Publish/subscribe and RPC across every context of the extension.
///
/// Handlers registered with [`on`](Self::on) anywhere are reachable from
/// [`send`](Self::send) everywhere: contexts that cannot be reached directly
/// announce their names upstream, and the upstream context registers proxy
/// actions that forward calls back down.
///
/// Cloning is cheap; clones share one registry.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("peer", &self.inner.peer)
            .field("address", &self.inner.address)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl Bus {
    /// Start building a bus.
    #[must_use]
    pub fn builder() -> BusBuilder {
        BusBuilder::default()
    }

    /// A bus with no transports. Only local handlers are reachable.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn local() -> Self {
        Self::builder().build()
    }

    /// This context's identity.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer
    }

    /// This context's address.
    #[must_use]
    pub fn address(&self) -> &PeerAddress {
        &self.inner.address
    }

    /// Whether another context sits above this one.
    #[must_use]
    pub fn has_upstream(&self) -> bool {
        self.inner.links.upstream().is_some()
    }

    /// Register a handler for `name`.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F) -> ActionId
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_handler(name, handler_fn(handler))
    }

    /// Register a pre-built [`Handler`] for `name`.
    pub fn on_handler(&self, name: impl Into<String>, handler: Handler) -> ActionId {
        let id = ActionId::new();
        self.inner.add_local(id, name.into(), handler);
        id
    }

    /// Register a handler that removes itself after its first invocation.
    pub fn once<F, Fut>(&self, name: impl Into<String>, handler: F) -> ActionId
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let id = ActionId::new();
        let name = name.into();
        let fired = AtomicBool::new(false);
        let bus: Weak<BusInner> = Arc::downgrade(&self.inner);
        let own_name = name.clone();
        let wrapped = handler_fn(move |args| {
            let first = !fired.swap(true, Ordering::SeqCst);
            if first && let Some(bus) = bus.upgrade() {
                bus.remove_local(&own_name, Some(id));
            }
            let call = first.then(|| handler(args));
            async move {
                match call {
                    Some(call) => call.await,
                    None => Ok(None),
                }
            }
        });
        self.inner.add_local(id, name, wrapped);
        id
    }

    /// Remove local handlers for `name`: one by id, or all. Returns how many.
    pub fn off(&self, name: &str, id: Option<ActionId>) -> usize {
        self.inner.remove_local(name, id)
    }

    /// Call `name` wherever it is registered and resolve with the first value.
    ///
    /// Local actions (including proxies) race the upstream context. Resolves
    /// to `None` when nothing answered.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Handler`] when no branch produced a value and at
    /// least one handler failed; the error carries this call's site.
    #[track_caller]
    pub fn send(
        &self,
        name: impl Into<String>,
        args: Vec<Value>,
    ) -> impl Future<Output = BusResult<Option<Value>>> + Send + 'static {
        let site = CallSite::caller();
        let inner = Arc::clone(&self.inner);
        let name = name.into();
        async move { inner.route_send(&name, args, Scope::All, site).await }
    }

    /// Call local, non-proxy handlers for `name` only.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Handler`] when no handler produced a value and at
    /// least one failed.
    #[track_caller]
    pub fn emit(
        &self,
        name: impl Into<String>,
        args: Vec<Value>,
    ) -> impl Future<Output = BusResult<Option<Value>>> + Send + 'static {
        let site = CallSite::caller();
        let inner = Arc::clone(&self.inner);
        let name = name.into();
        async move { inner.dispatch(&name, args, Scope::Local, site).await }
    }

    /// Set a named signal and broadcast it once.
    ///
    /// The value stays the answer to [`wait_signal`](Self::wait_signal) until
    /// it is set again.
    ///
    /// # Errors
    ///
    /// Propagates handler failures from the broadcast.
    #[track_caller]
    pub fn set_signal(
        &self,
        name: &str,
        value: Value,
    ) -> impl Future<Output = BusResult<Option<Value>>> + Send + 'static {
        let answer = value.clone();
        let id = self.on(format!("{SIGNAL_PREFIX}{name}"), move |_| {
            let answer = answer.clone();
            async move { Ok(Some(answer)) }
        });
        if let Some(previous) = self.inner.signals.insert(name.to_owned(), id) {
            self.off(&format!("{SIGNAL_PREFIX}{name}"), Some(previous));
        }
        debug!(name, "signal set");
        self.send(name, vec![value])
    }

    /// Wait for a signal: its current answer, or the next broadcast.
    ///
    /// Returns `None` only when `timeout` elapses first.
    ///
    /// # Errors
    ///
    /// This future does not fail today; the result type leaves room for
    /// transport failures.
    pub async fn wait_signal(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> BusResult<Option<Value>> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let listener = self.once(name, move |args| {
            let value = args.into_iter().next().unwrap_or(Value::Bool(true));
            if let Some(tx) = tx.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = tx.send(value);
            }
            async { Ok(None) }
        });
        self.settle().await;

        let query = self.send(format!("{SIGNAL_PREFIX}{name}"), Vec::new());
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let result = tokio::select! {
            Ok(Some(value)) = query => Some(value),
            Ok(value) = rx => Some(value),
            () = deadline => None,
        };
        self.off(name, Some(listener));
        if result.is_none() {
            debug!(name, "signal wait timed out");
        }
        Ok(result)
    }

    /// Wait until every announcement queued so far reached the upstream context.
    ///
    /// A context relaying announcements for its own downstream contexts
    /// settles those before acknowledging them, so this covers the whole
    /// chain up to the hub.
    pub async fn settle(&self) {
        self.inner.settle().await;
    }

    /// A view of this bus that prefixes every name with `scope`.
    #[must_use]
    pub fn scoped(&self, scope: impl Into<String>) -> ScopedBus {
        ScopedBus::new(self.clone(), scope.into())
    }

    /// Whether any action (local or proxy) is registered for `name`.
    #[must_use]
    pub fn has_listeners(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }

    /// Every name with at least one action, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Number of proxy actions registered for `name`.
    #[must_use]
    pub fn proxy_count(&self, name: &str) -> usize {
        self.inner.registry.proxy_count(name)
    }

    /// Remote contexts this bus forwards `name` to.
    #[must_use]
    pub fn proxy_targets(&self, name: &str) -> Vec<PeerHandle> {
        self.inner.registry.proxy_targets(name)
    }

    /// The serializer this bus encodes payloads with.
    #[must_use]
    pub fn serializer(&self) -> &Serializer {
        &self.inner.serializer
    }

    /// The liveness tracker for peers this bus holds proxies for.
    #[must_use]
    pub fn liveness(&self) -> &Liveness {
        &self.inner.liveness
    }
}

/// Builder for [`Bus`].
pub struct BusBuilder {
    peer: Option<PeerId>,
    extension: Option<Arc<dyn ExtensionPort>>,
    page: Option<Arc<dyn PagePort>>,
    liveness_interval: Duration,
    blob_idle_timeout: Duration,
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self {
            peer: None,
            extension: None,
            page: None,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            blob_idle_timeout: DEFAULT_BLOB_IDLE_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for BusBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusBuilder")
            .field("peer", &self.peer)
            .field("extension", &self.extension.is_some())
            .field("page", &self.page.is_some())
            .field("liveness_interval", &self.liveness_interval)
            .field("blob_idle_timeout", &self.blob_idle_timeout)
            .finish()
    }
}

impl BusBuilder {
    /// Use a fixed identity instead of a fresh one.
    #[must_use]
    pub fn peer_id(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Attach the extension messaging port.
    #[must_use]
    pub fn extension_port(mut self, port: Arc<dyn ExtensionPort>) -> Self {
        self.extension = Some(port);
        self
    }

    /// Attach the in-page frame port.
    #[must_use]
    pub fn page_port(mut self, port: Arc<dyn PagePort>) -> Self {
        self.page = Some(port);
        self
    }

    /// How often peers holding proxies are probed.
    #[must_use]
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// How long an unread blob reference stays valid.
    #[must_use]
    pub fn blob_idle_timeout(mut self, timeout: Duration) -> Self {
        self.blob_idle_timeout = timeout;
        self
    }

    /// Build the bus and start listening on its ports.
    ///
    /// A context with an upstream first retracts whatever a previous
    /// incarnation at the same address registered. Must be called from
    /// within a tokio runtime.
    #[must_use]
    pub fn build(self) -> Bus {
        let peer = self.peer.unwrap_or_default();
        let address = self
            .extension
            .as_ref()
            .map(|p| p.address())
            .or_else(|| self.page.as_ref().map(|p| p.address()))
            .unwrap_or_else(|| PeerAddress::new(format!("local:{peer}")));
        let links = Links::new(self.extension, self.page);
        let liveness_interval = self.liveness_interval;
        let serializer = Serializer::new(peer, self.blob_idle_timeout);

        let inner = Arc::new_cyclic(|bus: &Weak<BusInner>| BusInner {
            peer,
            address,
            registry: ActionRegistry::new(),
            serializer,
            links,
            liveness: Liveness::new(liveness_interval, Arc::new(BusProbe::new(bus.clone()))),
            announcements: Queue::new(),
            signals: DashMap::new(),
        });

        inner
            .links
            .listen(|via, downstream| Arc::new(LinkInbox::new(Arc::downgrade(&inner), via, downstream)));
        if inner.links.upstream().is_some() {
            inner.announce(PROXY_RESET, "");
        }
        debug!(
            peer = %inner.peer,
            address = %inner.address,
            upstream = ?inner.links.upstream(),
            "bus started"
        );
        Bus { inner }
    }
}
