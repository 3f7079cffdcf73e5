//! The observable graph over a state's automerge document.
//!
//! Every compound value (map, list, model instance) is an automerge object.
//! [`Graph`] keeps an arena entry per object with its kind and a parent
//! pointer; parents are only used to find the root. Application code reads
//! through [`NodeRef`] and writes through [`NodeMut`]. Writes lift plain
//! values into document objects as they go, so a freshly assigned map is part
//! of the synchronized graph the moment `set` returns.
//!
//! After a batch of writes commits, or a remote update lands, the graph is
//! reconciled against the document: model instances that appeared get their
//! `init` hook, instances that disappeared get `cleanup`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use automerge::{AutoCommit, ChangeHash, ObjId, ObjType, ROOT, ReadDoc, ScalarValue};
use automerge::transaction::Transactable;
use strand_core::value::Map;
use strand_core::{Location, Value};
use strand_storage::Record;
use tracing::{trace, warn};

use crate::doc::{child_obj, from_scalar, read_obj, read_prop, to_scalar};
use crate::error::{StateError, StateResult};
use crate::model::{MODEL_KEY, ModelHook, ModelInstance, ModelRegistry, VERSION_KEY, is_reserved};

/// One step of a path from the state root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    /// Map key.
    Key(String),
    /// List index.
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// What a compound node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Plain mapping.
    Map,
    /// Ordered list.
    List,
    /// Mapping tagged with a registered model name.
    Model,
}

#[derive(Debug, Clone)]
struct NodeEntry {
    kind: NodeKind,
    parent: Option<ObjId>,
}

#[derive(Debug, Clone)]
struct LiveModel {
    name: String,
    path: Vec<PathSegment>,
    value: Value,
}

/// A lifecycle hook waiting to run outside the graph lock.
pub(crate) struct HookCall {
    hook: ModelHook,
    model: LiveModel,
}

impl HookCall {
    pub(crate) fn run(&self, location: &Location) {
        (self.hook)(&ModelInstance {
            name: &self.model.name,
            location,
            path: &self.model.path,
            value: &self.model.value,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lift {
    /// Application write: strict models are enforced and versions stamped.
    Local,
    /// Persisted data: taken as-is, migrations fix it up later.
    Hydrate,
}

#[derive(Debug, Clone, Copy)]
enum Slot<'k> {
    Key(&'k str),
    Set(usize),
    Insert(usize),
}

/// A state's document plus the arena mirroring it.
pub(crate) struct Graph {
    doc: AutoCommit,
    location: Location,
    models: Arc<ModelRegistry>,
    nodes: HashMap<ObjId, NodeEntry>,
    live: HashMap<ObjId, LiveModel>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("location", &self.location)
            .field("nodes", &self.nodes.len())
            .field("models", &self.live.len())
            .finish_non_exhaustive()
    }
}

impl Graph {
    /// An empty document.
    pub(crate) fn new(location: Location, models: Arc<ModelRegistry>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT,
            NodeEntry {
                kind: NodeKind::Map,
                parent: None,
            },
        );
        Self {
            doc: AutoCommit::new(),
            location,
            models,
            nodes,
            live: HashMap::new(),
        }
    }

    /// A document loaded from a full save.
    pub(crate) fn load(
        bytes: &[u8],
        location: Location,
        models: Arc<ModelRegistry>,
    ) -> StateResult<Self> {
        let mut graph = Self::new(location, models);
        graph.doc = AutoCommit::load(bytes)?;
        let _ = graph.doc.save_incremental();
        graph.index()?;
        Ok(graph)
    }

    /// Lift a persisted record into this (empty) document.
    pub(crate) fn hydrate(&mut self, record: &Record) -> StateResult<()> {
        match &record.data {
            Value::Null => {},
            Value::Map(map) => {
                for (key, value) in map {
                    if key != VERSION_KEY {
                        self.write(&ROOT, Slot::Key(key), value, Lift::Hydrate)?;
                    }
                }
            },
            other => {
                return Err(StateError::InvalidOperation(format!(
                    "persisted data for {} is a {}, not a map",
                    self.location,
                    other.type_name()
                )));
            },
        }
        if let Some(version) = record.version {
            self.stamp(&ROOT, version)?;
        }
        Ok(())
    }

    pub(crate) fn location(&self) -> &Location {
        &self.location
    }

    pub(crate) fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub(crate) fn root(&self) -> NodeRef<'_> {
        NodeRef {
            graph: self,
            obj: ROOT,
        }
    }

    pub(crate) fn root_mut(&mut self) -> NodeMut<'_> {
        NodeMut {
            graph: self,
            obj: ROOT,
        }
    }

    pub(crate) fn node_mut(&mut self, obj: ObjId) -> NodeMut<'_> {
        NodeMut { graph: self, obj }
    }

    /// Stored version of `obj`, if stamped.
    pub(crate) fn version_of(&self, obj: &ObjId) -> Option<u64> {
        read_prop(&self.doc, obj, VERSION_KEY)
            .ok()
            .flatten()
            .and_then(|v| v.as_u64())
    }

    pub(crate) fn stamp(&mut self, obj: &ObjId, version: u64) -> StateResult<()> {
        self.doc
            .put(obj, VERSION_KEY, to_scalar(&Value::from(version))?)?;
        trace!(location = %self.location, version, "version stamped");
        Ok(())
    }

    /// Plain contents of `obj` without bookkeeping keys.
    pub(crate) fn detached(&self, obj: &ObjId) -> StateResult<Map> {
        let mut map = read_obj(&self.doc, obj)?.into_map().ok_or_else(|| {
            StateError::InvalidOperation("only maps can be migrated".into())
        })?;
        map.retain(|key, _| !is_reserved(key));
        Ok(map)
    }

    /// Root contents without the root version.
    pub(crate) fn data(&self) -> StateResult<Value> {
        let mut data = read_obj(&self.doc, &ROOT)?;
        if let Some(map) = data.as_map_mut() {
            map.remove(VERSION_KEY);
        }
        Ok(data)
    }

    pub(crate) fn record(&self) -> StateResult<Record> {
        Ok(Record {
            data: self.data()?,
            version: self.version_of(&ROOT),
        })
    }

    /// Whether the root holds nothing but bookkeeping.
    pub(crate) fn is_blank(&self) -> bool {
        self.doc.keys(&ROOT).all(|key| is_reserved(&key))
    }

    /// Merge changes made elsewhere.
    pub(crate) fn apply_remote(&mut self, update: &[u8]) -> StateResult<()> {
        let applied = self.doc.load_incremental(update)?;
        // Move the incremental cursor past remote changes so they are not
        // sent back out with the next local commit.
        let _ = self.doc.save_incremental();
        trace!(location = %self.location, applied, "remote update merged");
        Ok(())
    }

    /// Merge another context's full document. Returns its heads.
    pub(crate) fn merge_base(&mut self, base: &[u8]) -> StateResult<Vec<ChangeHash>> {
        let heads = AutoCommit::load(base)?.get_heads();
        self.apply_remote(base)?;
        Ok(heads)
    }

    /// Every change a document at `heads` has not seen.
    pub(crate) fn changes_after(&mut self, heads: &[ChangeHash]) -> Option<Vec<u8>> {
        let changes = self.doc.save_after(heads);
        (!changes.is_empty()).then_some(changes)
    }

    /// Close pending writes. Returns the update to broadcast, if any.
    pub(crate) fn commit(&mut self) -> Option<Vec<u8>> {
        let _ = self.doc.commit();
        let update = self.doc.save_incremental();
        (!update.is_empty()).then_some(update)
    }

    /// Drop writes since the last commit.
    pub(crate) fn rollback(&mut self) -> StateResult<()> {
        let dropped = self.doc.rollback();
        trace!(location = %self.location, dropped, "pending writes rolled back");
        self.index()
    }

    /// The whole document, for handing to another context.
    pub(crate) fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Model instances, parents before children.
    pub(crate) fn model_objects(&self) -> Vec<(ObjId, String)> {
        let mut found = Vec::new();
        self.collect_models(&ROOT, &mut found);
        found
    }

    fn collect_models(&self, obj: &ObjId, found: &mut Vec<(ObjId, String)>) {
        let children: Vec<ObjId> = match self.doc.object_type(obj) {
            Ok(ObjType::Map | ObjType::Table) => {
                if let Ok(Some(Value::String(name))) = read_prop(&self.doc, obj, MODEL_KEY) {
                    found.push((obj.clone(), name));
                }
                self.doc
                    .keys(obj)
                    .filter_map(|key| child_obj(&self.doc, obj, key.as_str()).map(|c| c.0))
                    .collect()
            },
            Ok(ObjType::List) => (0..self.doc.length(obj))
                .filter_map(|index| child_obj(&self.doc, obj, index).map(|c| c.0))
                .collect(),
            _ => Vec::new(),
        };
        for child in children {
            self.collect_models(&child, found);
        }
    }

    /// Rebuild the arena from the document and diff model instances.
    pub(crate) fn reconcile(&mut self) -> StateResult<Vec<HookCall>> {
        let (nodes, live) = self.walk()?;
        let mut cleanups: Vec<&LiveModel> = self
            .live
            .iter()
            .filter(|(obj, _)| !live.contains_key(*obj))
            .map(|(_, model)| model)
            .collect();
        cleanups.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.path.cmp(&b.path)));
        let mut inits: Vec<&LiveModel> = live
            .iter()
            .filter(|(obj, _)| !self.live.contains_key(*obj))
            .map(|(_, model)| model)
            .collect();
        inits.sort_by(|a, b| a.path.len().cmp(&b.path.len()).then(a.path.cmp(&b.path)));

        let mut calls = Vec::new();
        for model in cleanups {
            if let Some(hook) = self.models.get(&model.name).and_then(|d| d.cleanup_hook().cloned()) {
                calls.push(HookCall {
                    hook,
                    model: model.clone(),
                });
            }
        }
        for model in inits {
            if let Some(hook) = self.models.get(&model.name).and_then(|d| d.init_hook().cloned()) {
                calls.push(HookCall {
                    hook,
                    model: model.clone(),
                });
            }
        }

        self.nodes = nodes;
        self.live = live;
        Ok(calls)
    }

    /// Forget every instance, queueing their cleanup hooks.
    pub(crate) fn teardown(&mut self) -> Vec<HookCall> {
        let mut models: Vec<LiveModel> = self.live.drain().map(|(_, model)| model).collect();
        models.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.path.cmp(&b.path)));
        models
            .into_iter()
            .filter_map(|model| {
                let hook = self.models.get(&model.name)?.cleanup_hook()?.clone();
                Some(HookCall { hook, model })
            })
            .collect()
    }

    /// Rebuild the arena without touching lifecycle state.
    fn index(&mut self) -> StateResult<()> {
        let (nodes, _) = self.walk()?;
        self.nodes = nodes;
        Ok(())
    }

    fn walk(&self) -> StateResult<(HashMap<ObjId, NodeEntry>, HashMap<ObjId, LiveModel>)> {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT,
            NodeEntry {
                kind: NodeKind::Map,
                parent: None,
            },
        );
        let mut live = HashMap::new();
        self.visit(&ROOT, &mut Vec::new(), &mut nodes, &mut live)?;
        Ok((nodes, live))
    }

    fn visit(
        &self,
        obj: &ObjId,
        path: &mut Vec<PathSegment>,
        nodes: &mut HashMap<ObjId, NodeEntry>,
        live: &mut HashMap<ObjId, LiveModel>,
    ) -> StateResult<Value> {
        match self.doc.object_type(obj)? {
            ObjType::Map | ObjType::Table => {
                let mut map = Map::new();
                for key in self.doc.keys(obj).collect::<Vec<_>>() {
                    path.push(PathSegment::Key(key.clone()));
                    let value = self.visit_prop(obj, key.as_str(), path, nodes, live)?;
                    path.pop();
                    if let Some(value) = value {
                        map.insert(key, value);
                    }
                }
                if let Some(Value::String(name)) = map.get(MODEL_KEY) {
                    if self.models.contains(name) {
                        if let Some(entry) = nodes.get_mut(obj) {
                            entry.kind = NodeKind::Model;
                        }
                        live.insert(
                            obj.clone(),
                            LiveModel {
                                name: name.clone(),
                                path: path.clone(),
                                value: Value::Map(map.clone()),
                            },
                        );
                    } else {
                        warn!(location = %self.location, model = %name, "unregistered model left as plain map");
                    }
                }
                Ok(Value::Map(map))
            },
            ObjType::List => {
                let mut items = Vec::new();
                for index in 0..self.doc.length(obj) {
                    path.push(PathSegment::Index(index));
                    let value = self.visit_prop(obj, index, path, nodes, live)?;
                    path.pop();
                    items.push(value.unwrap_or_default());
                }
                Ok(Value::List(items))
            },
            ObjType::Text => Ok(Value::String(self.doc.text(obj)?)),
        }
    }

    fn visit_prop(
        &self,
        obj: &ObjId,
        prop: impl Into<automerge::Prop>,
        path: &mut Vec<PathSegment>,
        nodes: &mut HashMap<ObjId, NodeEntry>,
        live: &mut HashMap<ObjId, LiveModel>,
    ) -> StateResult<Option<Value>> {
        match self.doc.get(obj, prop)? {
            None => Ok(None),
            Some((automerge::Value::Scalar(scalar), _)) => Ok(Some(from_scalar(&scalar))),
            Some((automerge::Value::Object(kind), child)) => {
                let kind = match kind {
                    ObjType::List => NodeKind::List,
                    _ => NodeKind::Map,
                };
                nodes.insert(
                    child.clone(),
                    NodeEntry {
                        kind,
                        parent: Some(obj.clone()),
                    },
                );
                self.visit(&child, path, nodes, live).map(Some)
            },
        }
    }

    /// Write `value` into `slot` of `parent`, creating objects for compounds.
    fn write(&mut self, parent: &ObjId, slot: Slot<'_>, value: &Value, lift: Lift) -> StateResult<()> {
        match value {
            Value::Map(map) => {
                let descriptor = match map.get(MODEL_KEY) {
                    None => None,
                    Some(Value::String(name)) => Some(
                        self.models
                            .get(name)
                            .ok_or_else(|| StateError::UnknownModel(name.clone()))?,
                    ),
                    Some(other) => {
                        return Err(StateError::InvalidOperation(format!(
                            "{MODEL_KEY} must be a string, got {}",
                            other.type_name()
                        )));
                    },
                };
                if lift == Lift::Local
                    && let Some(descriptor) = &descriptor
                    && let Some(field) = map.keys().find(|key| !descriptor.declares(key))
                {
                    return Err(StateError::UndeclaredField {
                        model: descriptor.name().to_owned(),
                        field: field.clone(),
                    });
                }

                let obj = self.put_object(parent, slot, ObjType::Map)?;
                let kind = if descriptor.is_some() {
                    NodeKind::Model
                } else {
                    NodeKind::Map
                };
                self.adopt(&obj, parent, kind);

                if let Some(descriptor) = &descriptor {
                    self.doc.put(&obj, MODEL_KEY, descriptor.name())?;
                    // Every declared field exists before incoming values land.
                    for (field, default) in descriptor.fields() {
                        if !map.contains_key(field) {
                            self.write(&obj, Slot::Key(field), default, lift)?;
                        }
                    }
                    let versioner = descriptor.migrations();
                    if lift == Lift::Local && !versioner.is_empty() && !map.contains_key(VERSION_KEY) {
                        self.stamp(&obj, versioner.latest())?;
                    }
                }
                for (key, item) in map {
                    if key == MODEL_KEY && descriptor.is_some() {
                        continue;
                    }
                    self.write(&obj, Slot::Key(key), item, lift)?;
                }
            },
            Value::List(items) => {
                let obj = self.put_object(parent, slot, ObjType::List)?;
                self.adopt(&obj, parent, NodeKind::List);
                for (index, item) in items.iter().enumerate() {
                    self.write(&obj, Slot::Insert(index), item, lift)?;
                }
            },
            scalar => {
                let scalar = to_scalar(scalar)?;
                self.put_scalar(parent, slot, scalar)?;
            },
        }
        Ok(())
    }

    fn put_object(&mut self, parent: &ObjId, slot: Slot<'_>, kind: ObjType) -> StateResult<ObjId> {
        Ok(match slot {
            Slot::Key(key) => self.doc.put_object(parent, key, kind)?,
            Slot::Set(index) => self.doc.put_object(parent, index, kind)?,
            Slot::Insert(index) => self.doc.insert_object(parent, index, kind)?,
        })
    }

    fn put_scalar(&mut self, parent: &ObjId, slot: Slot<'_>, scalar: ScalarValue) -> StateResult<()> {
        match slot {
            Slot::Key(key) => self.doc.put(parent, key, scalar)?,
            Slot::Set(index) => self.doc.put(parent, index, scalar)?,
            Slot::Insert(index) => self.doc.insert(parent, index, scalar)?,
        }
        Ok(())
    }

    fn adopt(&mut self, obj: &ObjId, parent: &ObjId, kind: NodeKind) {
        self.nodes.insert(
            obj.clone(),
            NodeEntry {
                kind,
                parent: Some(parent.clone()),
            },
        );
    }

    fn kind_of(&self, obj: &ObjId) -> NodeKind {
        self.nodes.get(obj).map_or(NodeKind::Map, |entry| entry.kind)
    }
}

// ---------------------------------------------------------------------------
// Read access
// ---------------------------------------------------------------------------

/// Read access to one compound node.
#[derive(Clone)]
pub struct NodeRef<'a> {
    graph: &'a Graph,
    obj: ObjId,
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("kind", &self.kind())
            .field("value", &self.to_value())
            .finish()
    }
}

impl<'a> NodeRef<'a> {
    /// What this node is.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.graph.kind_of(&self.obj)
    }

    /// Model name, for model instances.
    #[must_use]
    pub fn model(&self) -> Option<String> {
        match self.get(MODEL_KEY)? {
            Value::String(name) => Some(name),
            _ => None,
        }
    }

    /// Stored schema version.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.graph.version_of(&self.obj)
    }

    /// Plain value under `key` of a map node.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        if self.kind() == NodeKind::List {
            return None;
        }
        read_prop(&self.graph.doc, &self.obj, key).ok().flatten()
    }

    /// Plain value at `index` of a list node.
    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<Value> {
        if self.kind() != NodeKind::List || index >= self.len() {
            return None;
        }
        read_prop(&self.graph.doc, &self.obj, index).ok().flatten()
    }

    /// Compound child under `key`.
    #[must_use]
    pub fn child(&self, key: &str) -> Option<NodeRef<'a>> {
        if self.kind() == NodeKind::List {
            return None;
        }
        let (obj, _) = child_obj(&self.graph.doc, &self.obj, key)?;
        Some(NodeRef {
            graph: self.graph,
            obj,
        })
    }

    /// Compound child at `index`.
    #[must_use]
    pub fn child_at(&self, index: usize) -> Option<NodeRef<'a>> {
        if self.kind() != NodeKind::List || index >= self.len() {
            return None;
        }
        let (obj, _) = child_obj(&self.graph.doc, &self.obj, index)?;
        Some(NodeRef {
            graph: self.graph,
            obj,
        })
    }

    /// Keys of a map node, sorted. Empty for lists.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        if self.kind() == NodeKind::List {
            return Vec::new();
        }
        self.graph.doc.keys(&self.obj).collect()
    }

    /// Number of keys or items.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.kind() {
            NodeKind::List => self.graph.doc.length(&self.obj),
            NodeKind::Map | NodeKind::Model => self.graph.doc.keys(&self.obj).count(),
        }
    }

    /// Whether the node has no keys or items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The node flattened to plain data.
    #[must_use]
    pub fn to_value(&self) -> Value {
        read_obj(&self.graph.doc, &self.obj).unwrap_or_else(|e| {
            warn!(error = %e, "node could not be read");
            Value::Null
        })
    }

    /// The node holding this one.
    #[must_use]
    pub fn parent(&self) -> Option<NodeRef<'a>> {
        let parent = self.graph.nodes.get(&self.obj)?.parent.clone()?;
        Some(NodeRef {
            graph: self.graph,
            obj: parent,
        })
    }

    /// The state root this node belongs to.
    #[must_use]
    pub fn root(&self) -> NodeRef<'a> {
        let mut node = self.clone();
        // Bounded by the arena size; a parent chain can never be longer.
        for _ in 0..self.graph.nodes.len() {
            match node.parent() {
                Some(parent) => node = parent,
                None => break,
            }
        }
        node
    }

    /// Whether this is the state root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.obj == ROOT
    }
}

// ---------------------------------------------------------------------------
// Write access
// ---------------------------------------------------------------------------

/// Write access to one compound node, inside a transaction.
pub struct NodeMut<'a> {
    graph: &'a mut Graph,
    obj: ObjId,
}

impl fmt::Debug for NodeMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeMut").field("node", &self.view()).finish()
    }
}

impl NodeMut<'_> {
    /// Read access to this node.
    #[must_use]
    pub fn view(&self) -> NodeRef<'_> {
        NodeRef {
            graph: self.graph,
            obj: self.obj.clone(),
        }
    }

    /// Plain value under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.view().get(key)
    }

    /// Plain value at `index`.
    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<Value> {
        self.view().get_index(index)
    }

    /// Number of keys or items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.view().len()
    }

    /// Whether the node has no keys or items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assign `value` to `key`, lifting compounds into the graph.
    ///
    /// # Errors
    ///
    /// Fails on list nodes, reserved keys, undeclared keys of strict models,
    /// unknown model names inside `value` and non-finite floats.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> StateResult<()> {
        self.expect(NodeKind::Map)?;
        if is_reserved(key) {
            return Err(StateError::InvalidOperation(format!("{key} is reserved")));
        }
        if let Some(name) = self.view().model()
            && let Some(descriptor) = self.graph.models().get(&name)
            && !descriptor.declares(key)
        {
            return Err(StateError::UndeclaredField {
                model: name,
                field: key.to_owned(),
            });
        }
        let obj = self.obj.clone();
        self.graph.write(&obj, Slot::Key(key), &value.into(), Lift::Local)
    }

    /// Remove `key`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Fails on list nodes and reserved keys.
    pub fn remove(&mut self, key: &str) -> StateResult<bool> {
        self.expect(NodeKind::Map)?;
        if is_reserved(key) {
            return Err(StateError::InvalidOperation(format!("{key} is reserved")));
        }
        let present = self.graph.doc.get(&self.obj, key)?.is_some();
        if present {
            self.graph.doc.delete(&self.obj, key)?;
        }
        Ok(present)
    }

    /// Append `value` to a list node.
    ///
    /// # Errors
    ///
    /// Fails on map nodes and for values that cannot be lifted.
    pub fn push(&mut self, value: impl Into<Value>) -> StateResult<()> {
        self.expect(NodeKind::List)?;
        let end = self.len();
        let obj = self.obj.clone();
        self.graph.write(&obj, Slot::Insert(end), &value.into(), Lift::Local)
    }

    /// Insert `value` before `index` of a list node.
    ///
    /// # Errors
    ///
    /// Fails on map nodes and when `index` is past the end.
    pub fn insert(&mut self, index: usize, value: impl Into<Value>) -> StateResult<()> {
        self.expect(NodeKind::List)?;
        self.check_index(index, true)?;
        let obj = self.obj.clone();
        self.graph.write(&obj, Slot::Insert(index), &value.into(), Lift::Local)
    }

    /// Replace the item at `index` of a list node.
    ///
    /// # Errors
    ///
    /// Fails on map nodes and when `index` is out of bounds.
    pub fn set_at(&mut self, index: usize, value: impl Into<Value>) -> StateResult<()> {
        self.expect(NodeKind::List)?;
        self.check_index(index, false)?;
        let obj = self.obj.clone();
        self.graph.write(&obj, Slot::Set(index), &value.into(), Lift::Local)
    }

    /// Remove the item at `index` of a list node.
    ///
    /// # Errors
    ///
    /// Fails on map nodes and when `index` is out of bounds.
    pub fn remove_at(&mut self, index: usize) -> StateResult<()> {
        self.expect(NodeKind::List)?;
        self.check_index(index, false)?;
        self.graph.doc.delete(&self.obj, index)?;
        Ok(())
    }

    /// Write access to the compound child under `key`.
    pub fn child_mut(&mut self, key: &str) -> Option<NodeMut<'_>> {
        let obj = self.view().child(key)?.obj;
        Some(NodeMut {
            graph: self.graph,
            obj,
        })
    }

    /// Write access to the compound child at `index`.
    pub fn child_at_mut(&mut self, index: usize) -> Option<NodeMut<'_>> {
        let obj = self.view().child_at(index)?.obj;
        Some(NodeMut {
            graph: self.graph,
            obj,
        })
    }

    fn expect(&self, kind: NodeKind) -> StateResult<()> {
        let actual = self.graph.kind_of(&self.obj);
        let matches = match kind {
            NodeKind::List => actual == NodeKind::List,
            NodeKind::Map | NodeKind::Model => actual != NodeKind::List,
        };
        if matches {
            Ok(())
        } else {
            Err(StateError::InvalidOperation(format!(
                "expected a {kind:?} node, found {actual:?}"
            )))
        }
    }

    fn check_index(&self, index: usize, inclusive: bool) -> StateResult<()> {
        let len = self.len();
        let in_bounds = if inclusive { index <= len } else { index < len };
        if in_bounds {
            Ok(())
        } else {
            Err(StateError::InvalidOperation(format!(
                "index {index} out of bounds for list of {len}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelDescriptor;
    use crate::versioner::Versioner;
    use std::sync::Mutex;

    fn registry() -> Arc<ModelRegistry> {
        let models = ModelRegistry::new();
        models.register(
            ModelDescriptor::new("Todo")
                .field("title", "")
                .field("done", false)
                .strict()
                .versioner(Versioner::new().step(2, |_| Ok(()))),
        );
        models.register(ModelDescriptor::new("Note"));
        Arc::new(models)
    }

    fn graph() -> Graph {
        Graph::new("proj/s/test".parse().unwrap(), registry())
    }

    #[test]
    fn test_plain_values_lift_into_document() {
        let mut graph = graph();
        let mut root = graph.root_mut();
        root.set("n", 1).unwrap();
        root.set("tags", Value::List(vec!["a".into(), "b".into()])).unwrap();
        root.set("nested", Value::from_iter([("x", 1)])).unwrap();
        root.child_mut("tags").unwrap().push("c").unwrap();
        root.child_mut("nested").unwrap().set("y", 2).unwrap();

        let expected = Value::from_iter([
            ("n", Value::Int(1)),
            ("tags", Value::List(vec!["a".into(), "b".into(), "c".into()])),
            ("nested", Value::from_iter([("x", 1), ("y", 2)])),
        ]);
        assert_eq!(graph.data().unwrap(), expected);
    }

    #[test]
    fn test_parents_lead_to_root() {
        let mut graph = graph();
        graph
            .root_mut()
            .set("a", Value::from_iter([("b", Value::List(vec![Value::map()]))]))
            .unwrap();
        let root = graph.root();
        let leaf = root.child("a").unwrap().child("b").unwrap().child_at(0).unwrap();
        assert_eq!(leaf.parent().unwrap().kind(), NodeKind::List);
        assert!(leaf.root().is_root());
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_model_fields_declared_before_values() {
        let mut graph = graph();
        let todo = registry().get("Todo").unwrap().instance([("title", "ship")]);
        graph.root_mut().set("todo", todo).unwrap();

        let node = graph.root().child("todo").unwrap();
        assert_eq!(node.kind(), NodeKind::Model);
        assert_eq!(node.model().as_deref(), Some("Todo"));
        assert_eq!(node.get("title"), Some(Value::from("ship")));
        assert_eq!(node.get("done"), Some(Value::Bool(false)));
        assert_eq!(node.version(), Some(2));
    }

    #[test]
    fn test_strict_model_rejects_undeclared_keys() {
        let mut graph = graph();
        let todo = registry().get("Todo").unwrap();
        let err = graph
            .root_mut()
            .set("todo", todo.instance([("colour", "red")]))
            .unwrap_err();
        assert!(matches!(err, StateError::UndeclaredField { .. }));

        graph.root_mut().set("todo", todo.instance([("title", "a")])).unwrap();
        let mut root = graph.root_mut();
        let mut node = root.child_mut("todo").unwrap();
        assert!(node.set("done", true).is_ok());
        assert!(matches!(
            node.set("colour", "red"),
            Err(StateError::UndeclaredField { .. })
        ));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let mut graph = graph();
        let value = Value::from_iter([(MODEL_KEY, "Ghost")]);
        assert!(matches!(
            graph.root_mut().set("g", value),
            Err(StateError::UnknownModel(name)) if name == "Ghost"
        ));
    }

    #[test]
    fn test_reserved_and_kind_checks() {
        let mut graph = graph();
        let mut root = graph.root_mut();
        assert!(root.set(VERSION_KEY, 3).is_err());
        assert!(root.push(1).is_err());
        root.set("list", Value::List(vec![])).unwrap();
        let mut list = root.child_mut("list").unwrap();
        assert!(list.set("k", 1).is_err());
        assert!(list.insert(1, 1).is_err());
        list.insert(0, "a").unwrap();
        list.set_at(0, "b").unwrap();
        assert_eq!(list.get_index(0), Some(Value::from("b")));
        list.remove_at(0).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_reconcile_reports_new_and_removed_models() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let models = ModelRegistry::new();
        let init_log = Arc::clone(&seen);
        let cleanup_log = Arc::clone(&seen);
        models.register(
            ModelDescriptor::new("Note")
                .on_init(move |m| init_log.lock().unwrap().push(format!("init {}", m.path[0])))
                .on_cleanup(move |m| {
                    cleanup_log
                        .lock()
                        .unwrap()
                        .push(format!("cleanup {}", m.value.get("text").unwrap().as_str().unwrap()));
                }),
        );
        let mut graph = Graph::new("p/s/n".parse().unwrap(), Arc::new(models));
        let location = graph.location().clone();

        let note = Value::from_iter([(MODEL_KEY, "Note"), ("text", "hi")]);
        graph.root_mut().set("first", note).unwrap();
        graph.commit();
        for call in graph.reconcile().unwrap() {
            call.run(&location);
        }
        assert!(graph.reconcile().unwrap().is_empty());

        graph.root_mut().remove("first").unwrap();
        graph.commit();
        for call in graph.reconcile().unwrap() {
            call.run(&location);
        }
        assert_eq!(*seen.lock().unwrap(), vec!["init first", "cleanup hi"]);
    }

    #[test]
    fn test_updates_merge_between_graphs() {
        let mut hub = graph();
        hub.root_mut().set("n", 0).unwrap();
        hub.commit();
        let mut spoke = Graph::load(&hub.save(), hub.location().clone(), registry()).unwrap();

        spoke.root_mut().set("n", 5).unwrap();
        let update = spoke.commit().unwrap();
        hub.apply_remote(&update).unwrap();
        assert_eq!(hub.root().get("n"), Some(Value::Int(5)));
        // Applying a remote update leaves nothing new to broadcast.
        assert!(hub.commit().is_none());
    }

    #[test]
    fn test_hydrate_keeps_persisted_shape() {
        let mut graph = graph();
        let record = Record {
            data: Value::from_iter([(
                "todo",
                Value::from_iter([(MODEL_KEY, "Todo"), ("legacy", "x")]),
            )]),
            version: Some(1),
        };
        graph.hydrate(&record).unwrap();
        let todo = graph.root().child("todo").unwrap();
        // Hydration neither enforces strictness nor stamps a version.
        assert_eq!(todo.get("legacy"), Some(Value::from("x")));
        assert_eq!(todo.version(), None);
        assert_eq!(graph.version_of(&ROOT), Some(1));
        assert_eq!(graph.record().unwrap().version, Some(1));
    }

    #[test]
    fn test_rollback_discards_pending_writes() {
        let mut graph = graph();
        graph.root_mut().set("kept", 1).unwrap();
        graph.commit();
        graph.root_mut().set("dropped", 2).unwrap();
        graph.rollback().unwrap();
        assert_eq!(graph.data().unwrap(), Value::from_iter([("kept", 1)]));
    }
}
