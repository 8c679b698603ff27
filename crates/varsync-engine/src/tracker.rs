use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use varsync_core::{ObjId, Path, Segment, Value, VarId};

use crate::registry::ObjectRegistry;
use crate::resolver;
use crate::store::VariableStore;

/// Limit on `@name` hops while evaluating one variable. Parent-relative
/// bases always move up the tree and cannot loop, so they are not counted.
const MAX_NAME_HOPS: usize = 64;

/// A watched variable whose transmitted value changed.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableUpdate {
    pub var_id: VarId,
    pub value: serde_json::Value,
}

/// What to do with a throttled refresh request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshSchedule {
    Now,
    After(Duration),
    /// A deferred refresh is already queued.
    Pending,
}

/// Keeps watched variables' transmitted values in step with backend state.
pub struct ChangeTracker {
    registry: Arc<ObjectRegistry>,
    watched: BTreeSet<VarId>,
    sent: HashMap<VarId, serde_json::Value>,
    throttle: Duration,
    last_refresh: Option<Instant>,
    refresh_pending: bool,
}

impl ChangeTracker {
    pub fn new(registry: Arc<ObjectRegistry>, throttle: Duration) -> Self {
        Self {
            registry,
            watched: BTreeSet::new(),
            sent: HashMap::new(),
            throttle,
            last_refresh: None,
            refresh_pending: false,
        }
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub fn is_registered(&self, id: VarId) -> bool {
        self.watched.contains(&id)
    }

    pub fn registered(&self) -> impl Iterator<Item = VarId> + '_ {
        self.watched.iter().copied()
    }

    /// Start tracking a variable. Registers its object value, if any, under
    /// the variable's id and returns the current transmitted value.
    pub fn register(&mut self, store: &mut VariableStore, id: VarId) -> serde_json::Value {
        self.watched.insert(id);
        let mut memo = HashMap::new();
        let stored = self.evaluate(store, id, &mut memo, 0);
        if let Value::Object(obj) = &stored {
            self.registry.register(obj, ObjId::from(id));
        }
        let value = self.serialize(&stored);
        self.sent.insert(id, value.clone());
        value
    }

    pub fn unregister(&mut self, id: VarId) {
        if self.watched.remove(&id) {
            self.sent.remove(&id);
            self.registry.unregister(ObjId::from(id));
        }
    }

    /// Recompute every watched variable and report those whose serialized
    /// form differs from what was last sent.
    pub fn refresh(&mut self, store: &mut VariableStore) -> Vec<VariableUpdate> {
        self.last_refresh = Some(Instant::now());
        self.refresh_pending = false;

        let mut memo = HashMap::new();
        let ids: Vec<VarId> = self.watched.iter().copied().collect();
        let mut values = Vec::with_capacity(ids.len());
        for id in ids {
            if !store.contains(id) {
                continue;
            }
            let stored = self.evaluate(store, id, &mut memo, 0);
            if let Value::Object(obj) = &stored {
                self.registry.register(obj, ObjId::from(id));
            }
            values.push((id, stored));
        }

        let mut updates = Vec::new();
        for (id, stored) in values {
            let value = self.serialize(&stored);
            if self.sent.get(&id) != Some(&value) {
                self.sent.insert(id, value.clone());
                updates.push(VariableUpdate { var_id: id, value });
            }
        }
        updates
    }

    /// The value most recently reported for a watched variable.
    pub fn last_sent(&self, id: VarId) -> Option<&serde_json::Value> {
        self.sent.get(&id)
    }

    /// Current transmitted value of any variable, watched or not.
    pub fn current(&mut self, store: &mut VariableStore, id: VarId) -> serde_json::Value {
        let mut memo = HashMap::new();
        let stored = self.evaluate(store, id, &mut memo, 0);
        self.serialize(&stored)
    }

    /// The stored backend value of a variable, used as a base for writes.
    pub fn backend_value(&mut self, store: &mut VariableStore, id: VarId) -> Value {
        let mut memo = HashMap::new();
        self.evaluate(store, id, &mut memo, 0)
    }

    /// Decide whether a non-interactive refresh request runs now or later.
    pub fn schedule(&mut self) -> RefreshSchedule {
        if self.refresh_pending {
            return RefreshSchedule::Pending;
        }
        let elapsed = self.last_refresh.map(|last| last.elapsed());
        match elapsed {
            Some(elapsed) if elapsed < self.throttle => {
                self.refresh_pending = true;
                RefreshSchedule::After(self.throttle - elapsed)
            }
            _ => RefreshSchedule::Now,
        }
    }

    fn evaluate(
        &mut self,
        store: &mut VariableStore,
        id: VarId,
        memo: &mut HashMap<VarId, Value>,
        hops: usize,
    ) -> Value {
        if let Some(value) = memo.get(&id) {
            return value.clone();
        }
        if hops > MAX_NAME_HOPS {
            return Value::Null;
        }
        let Some(var) = store.get(id) else {
            return Value::Null;
        };

        let raw = match var.path().cloned() {
            None => var.value().clone(),
            Some(path) => {
                let parent = var.parent_id;
                self.resolve_path(store, parent, &path, memo, hops)
                    .unwrap_or_default()
            }
        };
        let snapshot = self.serialize(&raw);

        let Some(var) = store.get_mut(id) else {
            return Value::Null;
        };
        var.observe(raw, snapshot);
        let stored = var.stored().clone();
        memo.insert(id, stored.clone());
        stored
    }

    /// Resolve a variable path, picking the base from a standard variable or
    /// from the parent (walking up for each leading `..`).
    fn resolve_path(
        &mut self,
        store: &mut VariableStore,
        parent: Option<VarId>,
        path: &Path,
        memo: &mut HashMap<VarId, Value>,
        hops: usize,
    ) -> Option<Value> {
        let (base_id, rest) = self.base_of(store, parent, path)?;
        let hops = hops + usize::from(path.standard_name().is_some());
        let base = self.evaluate(store, base_id, memo, hops);
        resolver::resolve(&base, rest)
    }

    /// The variable a path navigates from, and the segments left to follow.
    pub fn base_of<'p>(
        &self,
        store: &VariableStore,
        parent: Option<VarId>,
        path: &'p Path,
    ) -> Option<(VarId, &'p [Segment])> {
        if let Some(name) = path.standard_name() {
            return Some((store.lookup(name)?, &path.segments()[1..]));
        }
        let depth = path.parent_depth();
        let mut context = parent?;
        for _ in 0..depth {
            context = store.get(context)?.parent_id?;
        }
        Some((context, &path.segments()[depth..]))
    }

    /// Serialize a value for the wire. Nested registered objects become
    /// `{"obj": id}` tokens; an object met again while it is still being
    /// serialized gets an engine-owned id. The top level is always inlined.
    pub fn serialize(&self, value: &Value) -> serde_json::Value {
        let mut stack = Vec::new();
        self.encode(value, true, &mut stack)
    }

    /// Inline form of an object, as returned for `getObjects`.
    pub fn serialize_object(&self, obj: &varsync_core::ObjectRef) -> serde_json::Value {
        self.serialize(&Value::Object(obj.clone()))
    }

    fn encode(&self, value: &Value, top: bool, stack: &mut Vec<usize>) -> serde_json::Value {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.encode(v, false, stack)).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.encode(v, false, stack)))
                    .collect(),
            ),
            Value::Object(obj) => {
                if !top {
                    if let Some(id) = self.registry.id_of(obj) {
                        return json!({ "obj": id });
                    }
                }
                let identity = obj.identity();
                if stack.contains(&identity) {
                    return json!({ "obj": self.registry.assign_engine_id(obj) });
                }
                stack.push(identity);
                let fields = obj
                    .fields()
                    .into_iter()
                    .map(|(k, v)| {
                        let encoded = self.encode(&v, false, stack);
                        (k, encoded)
                    })
                    .collect();
                stack.pop();
                serde_json::Value::Object(fields)
            }
        }
    }
}
