//! The per-context root object.

use std::sync::Arc;

use strand_bus::{Bus, ExtensionPort, PagePort};
use strand_config::Config;
use strand_core::{ContextKind, Upstream};
use strand_state::{ModelRegistry, Store};
use strand_storage::{KvStore, RecordStore};
use strand_telemetry::ContextInfo;
use tracing::info;

use crate::config_bridge::{configure_bus, to_store_settings};
use crate::error::{RuntimeError, RuntimeResult};

/// Everything one context needs: its bus, its store and the configuration
/// both were built from.
///
/// Build one per context with [`Runtime::builder`]. Cloning is cheap.
#[derive(Clone)]
pub struct Runtime {
    info: Arc<ContextInfo>,
    bus: Bus,
    store: Store,
    config: Arc<Config>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("kind", &self.info.kind)
            .field("peer", &self.info.peer)
            .field("address", &self.info.address)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Start wiring a context of `kind`.
    #[must_use]
    pub fn builder(kind: ContextKind) -> RuntimeBuilder {
        RuntimeBuilder {
            kind,
            extension: None,
            page: None,
            storage: None,
            config: None,
            models: None,
        }
    }

    /// What kind of context this is.
    #[must_use]
    pub fn kind(&self) -> ContextKind {
        self.info.kind
    }

    /// Identity and start time.
    #[must_use]
    pub fn info(&self) -> &ContextInfo {
        &self.info
    }

    /// The context's bus.
    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// The context's state store.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The configuration the context was built from.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Save and disconnect every state instance.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while saving.
    pub async fn close(&self) -> RuntimeResult<()> {
        let result = self.store.close().await;
        info!(
            kind = %self.info.kind,
            uptime_ms = self.info.uptime_ms(),
            "runtime closed"
        );
        result.map_err(RuntimeError::from)
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    kind: ContextKind,
    extension: Option<Arc<dyn ExtensionPort>>,
    page: Option<Arc<dyn PagePort>>,
    storage: Option<Arc<dyn KvStore>>,
    config: Option<Config>,
    models: Option<Arc<ModelRegistry>>,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("kind", &self.kind)
            .field("extension", &self.extension.is_some())
            .field("page", &self.page.is_some())
            .field("storage", &self.storage.is_some())
            .finish_non_exhaustive()
    }
}

impl RuntimeBuilder {
    /// Attach the host's extension messaging port.
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

    /// Persistent storage. Only the background context owns one.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn KvStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Configuration. Defaults to [`Config::default`].
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Registered models. Every context of an extension should share the
    /// same set.
    #[must_use]
    pub fn models(mut self, models: Arc<ModelRegistry>) -> Self {
        self.models = Some(models);
        self
    }

    fn wiring(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::Wiring {
            kind: self.kind,
            message: message.into(),
        }
    }

    /// Check that the ports and storage match the kind of context.
    fn check(&self) -> RuntimeResult<()> {
        let extension_hub = self.extension.as_ref().map(|p| p.is_hub());
        let page_top = self.page.as_ref().map(|p| p.is_top());

        match self.kind.upstream() {
            Upstream::None => {
                if extension_hub == Some(false) {
                    return Err(self.wiring("extension port is not the hub's"));
                }
                if self.page.is_some() {
                    return Err(self.wiring("the background has no page"));
                }
                if self.storage.is_none() {
                    return Err(self.wiring("the background needs storage"));
                }
            },
            Upstream::Extension => {
                match extension_hub {
                    None => return Err(self.wiring("missing extension port")),
                    Some(true) => return Err(self.wiring("only the background is the hub")),
                    Some(false) => {},
                }
                if page_top == Some(false) {
                    return Err(self.wiring("a nested frame must be a page context"));
                }
                if self.page.is_some() && self.kind != ContextKind::ContentScript {
                    return Err(self.wiring("only content scripts serve a page"));
                }
            },
            Upstream::Page => {
                match page_top {
                    None => return Err(self.wiring("missing page port")),
                    Some(true) => return Err(self.wiring("page port belongs to a top frame")),
                    Some(false) => {},
                }
                if self.extension.is_some() {
                    return Err(self.wiring("a page context has no extension messaging"));
                }
            },
        }

        if self.storage.is_some() && !self.kind.is_authoritative() {
            return Err(self.wiring("only the background owns storage"));
        }
        Ok(())
    }

    /// Wire the bus and the store.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Wiring`] if the ports or storage do not fit
    /// the kind of context.
    pub fn build(self) -> RuntimeResult<Runtime> {
        self.check()?;
        let config = self.config.unwrap_or_default();
        let models = self.models.unwrap_or_default();

        let mut bus = configure_bus(&config, Bus::builder());
        if let Some(port) = self.extension {
            bus = bus.extension_port(port);
        }
        if let Some(port) = self.page {
            bus = bus.page_port(port);
        }
        let bus = bus.build();

        let settings = to_store_settings(&config);
        let store = match self.storage {
            Some(storage) => Store::authoritative(
                bus.clone(),
                RecordStore::new(storage),
                models,
                settings,
            ),
            None => Store::dependent(bus.clone(), models, settings),
        };

        let info = ContextInfo::new(self.kind, bus.peer_id(), bus.address().to_string());
        info!(
            kind = %info.kind,
            peer = %info.peer,
            address = %info.address,
            authoritative = store.is_authoritative(),
            "runtime started"
        );

        Ok(Runtime {
            info: Arc::new(info),
            bus,
            store,
            config: Arc::new(config),
        })
    }
}
