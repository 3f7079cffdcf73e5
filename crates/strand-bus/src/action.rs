//! Named actions and the registry that holds them.
//!
//! An [`Action`] is a handler registered under a name. Local actions are
//! registered by application code through the bus. Proxy actions carry a
//! [`PeerHandle`] target and exist only to forward a call to the context
//! that registered the real handler; bridges create them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use strand_core::{PeerAddress, PeerId, Value};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::HandlerError;

/// What a handler resolves to: a value, nothing, or a failure.
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// Boxed handler future.
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// A type-erased handler.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Registration handle for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(Uuid);

impl ActionId {
    /// Create a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which transport reaches a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Via {
    /// Extension messaging (hub and spokes).
    Extension,
    /// In-page channel (top frame and nested frames).
    Page,
}

/// A remote context that registered a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    /// Where to deliver forwarded calls.
    pub address: PeerAddress,
    /// Identity the peer announced itself with.
    pub peer: PeerId,
    /// Transport that reaches it.
    pub via: Via,
}

/// A registered handler.
#[derive(Clone)]
pub struct Action {
    /// Registration handle.
    pub id: ActionId,
    /// Name the action answers to.
    pub name: String,
    /// The handler.
    pub handler: Handler,
    /// Set for proxy actions: the origin the call is forwarded to.
    pub target: Option<PeerHandle>,
}

impl Action {
    /// A local action.
    #[must_use]
    pub fn local(id: ActionId, name: impl Into<String>, handler: Handler) -> Self {
        Self {
            id,
            name: name.into(),
            handler,
            target: None,
        }
    }

    /// A proxy action forwarding to `target`.
    #[must_use]
    pub fn proxy(name: impl Into<String>, target: PeerHandle, handler: Handler) -> Self {
        Self {
            id: ActionId::new(),
            name: name.into(),
            handler,
            target: Some(target),
        }
    }

    /// Whether this is a proxy action.
    #[must_use]
    pub fn is_proxy(&self) -> bool {
        self.target.is_some()
    }

    fn targets(&self, address: &PeerAddress) -> bool {
        self.target.as_ref().is_some_and(|t| &t.address == address)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Which actions a dispatch considers.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// Local actions only.
    Local,
    /// Local and proxy actions.
    All,
    /// Local and proxy actions, minus proxies targeting this address.
    Except(&'a PeerAddress),
}

/// Outcome of a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Removal {
    /// Number of actions removed.
    pub removed: usize,
    /// The name has no actions left and had some before.
    pub now_absent: bool,
}

/// Registry of actions keyed by name.
///
/// Invariant: at most one proxy action per `(name, target address)`.
#[derive(Default)]
pub struct ActionRegistry {
    actions: DashMap<String, Vec<Action>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("names", &self.actions.len())
            .finish()
    }
}

impl ActionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an action. Returns `true` if the name had no actions before.
    ///
    /// A proxy for an already-proxied `(name, target address)` replaces the
    /// existing entry in place.
    pub fn insert(&self, action: Action) -> bool {
        let mut entry = self.actions.entry(action.name.clone()).or_default();
        let was_empty = entry.is_empty();
        if let Some(target) = &action.target
            && let Some(existing) = entry.iter_mut().find(|a| a.targets(&target.address))
        {
            trace!(name = %action.name, target = %target.address, "proxy replaced");
            *existing = action;
            return false;
        }
        debug!(
            name = %action.name,
            id = %action.id,
            proxy = action.is_proxy(),
            "action registered"
        );
        entry.push(action);
        was_empty
    }

    fn remove_where<P>(&self, name: &str, pred: P) -> Removal
    where
        P: Fn(&Action) -> bool,
    {
        let Some(mut entry) = self.actions.get_mut(name) else {
            return Removal::default();
        };
        let before = entry.len();
        entry.retain(|a| !pred(a));
        let removed = before.saturating_sub(entry.len());
        let now_empty = entry.is_empty();
        drop(entry);
        if now_empty {
            self.actions.remove_if(name, |_, v| v.is_empty());
        }
        if removed > 0 {
            debug!(name, removed, "actions removed");
        }
        Removal {
            removed,
            now_absent: removed > 0 && now_empty,
        }
    }

    /// Remove local actions for `name`: one by id, or all of them.
    pub fn remove_local(&self, name: &str, id: Option<ActionId>) -> Removal {
        self.remove_where(name, |a| {
            !a.is_proxy() && id.is_none_or(|id| a.id == id)
        })
    }

    /// Remove the proxy for `(name, address)`.
    pub fn remove_proxy(&self, name: &str, address: &PeerAddress) -> Removal {
        self.remove_where(name, |a| a.targets(address))
    }

    /// Remove every proxy targeting `address`. Returns the names left empty.
    pub fn remove_proxies_to(&self, address: &PeerAddress) -> Vec<String> {
        let names: Vec<String> = self
            .actions
            .iter()
            .filter(|e| e.value().iter().any(|a| a.targets(address)))
            .map(|e| e.key().clone())
            .collect();
        names
            .into_iter()
            .filter(|name| self.remove_proxy(name, address).now_absent)
            .collect()
    }

    /// Snapshot of the actions for `name` within `scope`.
    #[must_use]
    pub fn matching(&self, name: &str, scope: Scope<'_>) -> Vec<Action> {
        self.actions
            .get(name)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|a| match scope {
                        Scope::Local => !a.is_proxy(),
                        Scope::All => true,
                        Scope::Except(address) => !a.targets(address),
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any action (local or proxy) is registered for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.actions.get(name).is_some_and(|e| !e.is_empty())
    }

    /// Number of proxy actions for `name`.
    #[must_use]
    pub fn proxy_count(&self, name: &str) -> usize {
        self.actions
            .get(name)
            .map_or(0, |e| e.iter().filter(|a| a.is_proxy()).count())
    }

    /// Proxy targets registered for `name`.
    #[must_use]
    pub fn proxy_targets(&self, name: &str) -> Vec<PeerHandle> {
        self.actions
            .get(name)
            .map(|e| e.iter().filter_map(|a| a.target.clone()).collect())
            .unwrap_or_default()
    }

    /// Every name with at least one action, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        handler_fn(|_| async { Ok(None) })
    }

    fn target(address: &str) -> PeerHandle {
        PeerHandle {
            address: PeerAddress::new(address),
            peer: PeerId::new(),
            via: Via::Extension,
        }
    }

    #[test]
    fn test_insert_reports_first_action() {
        let registry = ActionRegistry::new();
        assert!(registry.insert(Action::local(ActionId::new(), "a", noop())));
        assert!(!registry.insert(Action::local(ActionId::new(), "a", noop())));
        assert_eq!(registry.matching("a", Scope::Local).len(), 2);
    }

    #[test]
    fn test_at_most_one_proxy_per_target() {
        let registry = ActionRegistry::new();
        for _ in 0..3 {
            registry.insert(Action::proxy("a", target("tab-1"), noop()));
        }
        registry.insert(Action::proxy("a", target("tab-2"), noop()));
        assert_eq!(registry.proxy_count("a"), 2);

        registry.remove_proxy("a", &PeerAddress::new("tab-1"));
        registry.insert(Action::proxy("a", target("tab-1"), noop()));
        assert_eq!(registry.proxy_count("a"), 2);
    }

    #[test]
    fn test_remove_local_by_id_leaves_others() {
        let registry = ActionRegistry::new();
        let keep = ActionId::new();
        let drop_id = ActionId::new();
        registry.insert(Action::local(keep, "a", noop()));
        registry.insert(Action::local(drop_id, "a", noop()));
        registry.insert(Action::proxy("a", target("tab-1"), noop()));

        let removal = registry.remove_local("a", Some(drop_id));
        assert_eq!(removal.removed, 1);
        assert!(!removal.now_absent);

        let removal = registry.remove_local("a", None);
        assert_eq!(removal.removed, 1);
        assert!(!removal.now_absent);
        assert_eq!(registry.proxy_count("a"), 1);
    }

    #[test]
    fn test_scope_except_skips_sender_proxy() {
        let registry = ActionRegistry::new();
        registry.insert(Action::local(ActionId::new(), "a", noop()));
        registry.insert(Action::proxy("a", target("tab-1"), noop()));
        registry.insert(Action::proxy("a", target("tab-2"), noop()));

        let sender = PeerAddress::new("tab-1");
        assert_eq!(registry.matching("a", Scope::Except(&sender)).len(), 2);
        assert_eq!(registry.matching("a", Scope::All).len(), 3);
        assert_eq!(registry.matching("a", Scope::Local).len(), 1);
    }

    #[test]
    fn test_remove_proxies_to_reports_emptied_names() {
        let registry = ActionRegistry::new();
        registry.insert(Action::proxy("a", target("tab-1"), noop()));
        registry.insert(Action::proxy("b", target("tab-1"), noop()));
        registry.insert(Action::local(ActionId::new(), "b", noop()));

        let emptied = registry.remove_proxies_to(&PeerAddress::new("tab-1"));
        assert_eq!(emptied, vec!["a".to_string()]);
        assert!(!registry.contains("a"));
        assert!(registry.contains("b"));
        assert_eq!(registry.names(), vec!["b".to_string()]);
    }
}
