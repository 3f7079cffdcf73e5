//! Name-prefixed views of a bus.

use std::future::Future;

use strand_core::Value;

use crate::action::{ActionId, Handler, HandlerResult};
use crate::bus::Bus;
use crate::error::BusResult;

/// Separator between a scope and the names inside it.
pub const SCOPE_SEPARATOR: char = ':';

/// A bus view whose names all live under one scope.
///
/// `scoped.on("update", ..)` registers `"{scope}:update"` on the parent bus,
/// so two scopes never see each other's traffic.
#[derive(Debug, Clone)]
pub struct ScopedBus {
    bus: Bus,
    scope: String,
}

impl ScopedBus {
    pub(crate) fn new(bus: Bus, scope: String) -> Self {
        Self { bus, scope }
    }

    /// The scope prefix.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The parent bus.
    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Full name of `name` inside this scope.
    #[must_use]
    pub fn name(&self, name: &str) -> String {
        format!("{}{SCOPE_SEPARATOR}{name}", self.scope)
    }

    /// See [`Bus::on`].
    pub fn on<F, Fut>(&self, name: &str, handler: F) -> ActionId
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.bus.on(self.name(name), handler)
    }

    /// See [`Bus::on_handler`].
    pub fn on_handler(&self, name: &str, handler: Handler) -> ActionId {
        self.bus.on_handler(self.name(name), handler)
    }

    /// See [`Bus::once`].
    pub fn once<F, Fut>(&self, name: &str, handler: F) -> ActionId
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.bus.once(self.name(name), handler)
    }

    /// See [`Bus::off`].
    pub fn off(&self, name: &str, id: Option<ActionId>) -> usize {
        self.bus.off(&self.name(name), id)
    }

    /// See [`Bus::send`].
    ///
    /// # Errors
    ///
    /// See [`Bus::send`].
    #[track_caller]
    pub fn send(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = BusResult<Option<Value>>> + Send + 'static {
        self.bus.send(self.name(name), args)
    }

    /// See [`Bus::emit`].
    ///
    /// # Errors
    ///
    /// See [`Bus::emit`].
    #[track_caller]
    pub fn emit(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = BusResult<Option<Value>>> + Send + 'static {
        self.bus.emit(self.name(name), args)
    }

    /// See [`Bus::has_listeners`].
    #[must_use]
    pub fn has_listeners(&self, name: &str) -> bool {
        self.bus.has_listeners(&self.name(name))
    }
}
