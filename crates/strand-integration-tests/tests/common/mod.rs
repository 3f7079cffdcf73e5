//! Shared harness for integration tests.

use std::sync::Arc;
use std::time::Duration;

use strand_config::Config;
use strand_core::ContextKind;
use strand_runtime::Runtime;
use strand_state::ModelRegistry;
use strand_storage::{KvStore, MemoryKvStore, RecordStore};
use strand_test::LocalHost;

/// Address of the background context.
pub const BACKGROUND: &str = "background";

/// A simulated extension: one browser, one background context and its
/// storage, and whatever other contexts a test starts.
#[allow(dead_code)]
pub struct Browser {
    /// The simulated host.
    pub host: LocalHost,
    /// The background context.
    pub background: Runtime,
    /// The background's persistent storage; survives background restarts.
    pub storage: Arc<dyn KvStore>,
    /// Models shared by every context.
    pub models: Arc<ModelRegistry>,
    config: Config,
}

#[allow(dead_code)]
impl Browser {
    /// Start a browser with default configuration.
    pub fn start() -> Self {
        Self::with_config(Config::default(), Arc::new(ModelRegistry::new()))
    }

    /// Start a browser with a given configuration and model set.
    pub fn with_config(config: Config, models: Arc<ModelRegistry>) -> Self {
        strand_test::setup_test_logging_default();
        let host = LocalHost::new();
        let storage: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let background = start_background(&host, &storage, &config, &models);
        Self {
            host,
            background,
            storage,
            models,
            config,
        }
    }

    /// Start a browser whose liveness probes run every `interval`.
    pub fn with_liveness(interval: Duration) -> Self {
        let secs = interval.as_secs().max(1);
        let config = Config::from_toml_str(&format!("[bus]\nliveness_interval_secs = {secs}"))
            .expect("valid config");
        Self::with_config(config, Arc::new(ModelRegistry::new()))
    }

    /// Records as the background persisted them.
    pub fn records(&self) -> RecordStore {
        RecordStore::new(Arc::clone(&self.storage))
    }

    /// Start a non-background extension context at `address`.
    pub fn spoke(&self, kind: ContextKind, address: &str) -> Runtime {
        Runtime::builder(kind)
            .extension_port(self.host.spoke(address))
            .config(self.config.clone())
            .models(Arc::clone(&self.models))
            .build()
            .expect("spoke wiring")
    }

    /// Start a content script that also serves its page's nested frames.
    pub fn content_script(&self, address: &str) -> Runtime {
        Runtime::builder(ContextKind::ContentScript)
            .extension_port(self.host.spoke(address))
            .page_port(self.host.top_frame(address))
            .config(self.config.clone())
            .models(Arc::clone(&self.models))
            .build()
            .expect("content script wiring")
    }

    /// Start a page context in a frame nested under `top`.
    pub fn frame(&self, top: &str, address: &str) -> Runtime {
        Runtime::builder(ContextKind::Page)
            .page_port(self.host.nested_frame(top, address))
            .config(self.config.clone())
            .models(Arc::clone(&self.models))
            .build()
            .expect("frame wiring")
    }

    /// Kill the background context and start a fresh one over the same
    /// storage.
    pub fn restart_background(&mut self) {
        self.host.kill(BACKGROUND);
        self.background = start_background(&self.host, &self.storage, &self.config, &self.models);
    }
}

fn start_background(
    host: &LocalHost,
    storage: &Arc<dyn KvStore>,
    config: &Config,
    models: &Arc<ModelRegistry>,
) -> Runtime {
    Runtime::builder(ContextKind::Background)
        .extension_port(host.hub(BACKGROUND))
        .storage(Arc::clone(storage))
        .config(config.clone())
        .models(Arc::clone(models))
        .build()
        .expect("background wiring")
}
