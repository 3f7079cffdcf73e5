//! Model descriptors and the registry hydration consults.
//!
//! A model instance is a map tagged with `"$model": <name>`. When the graph
//! lifts such a map it looks the name up here, lays down every declared field
//! first, then assigns the incoming values. Lifecycle hooks run once the
//! surrounding write has committed: `init` when an instance appears in the
//! graph, `cleanup` when it leaves.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use strand_core::{Location, Value};
use tracing::debug;

use crate::node::PathSegment;
use crate::versioner::Versioner;

/// Key holding a model instance's registered name.
pub const MODEL_KEY: &str = "$model";

/// Key holding an instance's schema version.
pub const VERSION_KEY: &str = "$version";

/// Whether `key` is reserved for bookkeeping.
#[must_use]
pub fn is_reserved(key: &str) -> bool {
    key == MODEL_KEY || key == VERSION_KEY
}

/// A model instance as seen by a lifecycle hook.
#[derive(Debug)]
pub struct ModelInstance<'a> {
    /// Registered model name.
    pub name: &'a str,
    /// State instance the model lives in.
    pub location: &'a Location,
    /// Path from the state root.
    pub path: &'a [PathSegment],
    /// Contents at the time of the event.
    pub value: &'a Value,
}

/// A lifecycle hook.
pub type ModelHook = Arc<dyn Fn(&ModelInstance<'_>) + Send + Sync>;

/// Shape and lifecycle of one model class.
#[derive(Clone)]
pub struct ModelDescriptor {
    name: String,
    fields: Vec<(String, Value)>,
    strict: bool,
    versioner: Versioner,
    init: Option<ModelHook>,
    cleanup: Option<ModelHook>,
}

impl fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDescriptor")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("strict", &self.strict)
            .field("versioner", &self.versioner)
            .finish_non_exhaustive()
    }
}

impl ModelDescriptor {
    /// Describe a model called `name` with no fields.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            strict: false,
            versioner: Versioner::new(),
            init: None,
            cleanup: None,
        }
    }

    /// Declare a field and the value it starts with.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        let name = name.into();
        let default = default.into();
        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some(slot) => slot.1 = default,
            None => self.fields.push((name, default)),
        }
        self
    }

    /// Reject keys that are not declared.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Migrations for instances of this model.
    #[must_use]
    pub fn versioner(mut self, versioner: Versioner) -> Self {
        self.versioner = versioner;
        self
    }

    /// Run `hook` after an instance joins a graph.
    #[must_use]
    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ModelInstance<'_>) + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(hook));
        self
    }

    /// Run `hook` after an instance leaves a graph.
    #[must_use]
    pub fn on_cleanup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ModelInstance<'_>) + Send + Sync + 'static,
    {
        self.cleanup = Some(Arc::new(hook));
        self
    }

    /// Registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared fields with their defaults, in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    /// Whether undeclared keys are rejected.
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// This model's migrations.
    #[must_use]
    pub fn migrations(&self) -> &Versioner {
        &self.versioner
    }

    pub(crate) fn init_hook(&self) -> Option<&ModelHook> {
        self.init.as_ref()
    }

    pub(crate) fn cleanup_hook(&self) -> Option<&ModelHook> {
        self.cleanup.as_ref()
    }

    /// Whether `key` may be set on an instance.
    #[must_use]
    pub fn declares(&self, key: &str) -> bool {
        !self.strict || is_reserved(key) || self.fields.iter().any(|(field, _)| field == key)
    }

    /// Plain data for a new instance carrying `values`.
    ///
    /// Fields not given take their defaults when the instance is hydrated.
    pub fn instance<K, V>(&self, values: impl IntoIterator<Item = (K, V)>) -> Value
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let mut value: Value = values.into_iter().collect();
        if let Some(map) = value.as_map_mut() {
            map.insert(MODEL_KEY.to_owned(), Value::from(self.name.as_str()));
        }
        value
    }
}

/// Model descriptors by name.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: DashMap<String, Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any with the same name.
    pub fn register(&self, descriptor: ModelDescriptor) -> Option<Arc<ModelDescriptor>> {
        debug!(model = %descriptor.name, strict = descriptor.strict, "model registered");
        self.models
            .insert(descriptor.name.clone(), Arc::new(descriptor))
    }

    /// Look up a descriptor.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.models.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
