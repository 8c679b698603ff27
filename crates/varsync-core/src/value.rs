//! Backend object model navigated by variable paths.
//!
//! Plain data (`Map`, `Array`, scalars) has value semantics. `Object` is a
//! shared, identity-bearing record with interior mutability: two paths that
//! reach the same `ObjectRef` reach the same object.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

/// A callable attached to an object. Called with `None` when a path reads
/// through `name()`, and with `Some(value)` when a path writes to it.
pub type Method = Arc<dyn Fn(&ObjectRef, Option<Value>) -> Value + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(ObjectRef),
}

impl Value {
    /// Convert plain JSON. JSON objects become identity-free maps.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Read a named member: a map entry or an object field.
    pub fn member(&self, name: &str) -> Option<Value> {
        match self {
            Self::Map(map) => map.get(name).cloned(),
            Self::Object(obj) => obj.get(name),
            _ => None,
        }
    }

    /// Read a 1-based array element.
    pub fn element(&self, index: usize) -> Option<Value> {
        match self {
            Self::Array(items) => index.checked_sub(1).and_then(|i| items.get(i)).cloned(),
            _ => None,
        }
    }
}

/// Objects compare by identity; everything else structurally.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Self::Object(obj)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

#[derive(Default)]
struct ObjectInner {
    fields: RwLock<BTreeMap<String, Value>>,
    methods: RwLock<HashMap<String, Method>>,
}

/// Shared handle to a backend object.
#[derive(Clone, Default)]
pub struct ObjectRef(Arc<ObjectInner>);

impl ObjectRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let obj = Self::new();
        {
            let mut map = obj.0.fields.write();
            for (k, v) in fields {
                map.insert(k.into(), v.into());
            }
        }
        obj
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.fields.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.fields.read().contains_key(name)
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.fields.write().insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.0.fields.write().remove(name)
    }

    /// Snapshot of all fields, in name order.
    pub fn fields(&self) -> Vec<(String, Value)> {
        self.0
            .fields
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn define_method<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&ObjectRef, Option<Value>) -> Value + Send + Sync + 'static,
    {
        self.0.methods.write().insert(name.into(), Arc::new(f));
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.0.methods.read().contains_key(name)
    }

    /// Invoke a method. No lock is held while it runs, so the method may
    /// freely touch this object's fields.
    pub fn call(&self, name: &str, arg: Option<Value>) -> Option<Value> {
        let method = self.0.methods.read().get(name).cloned()?;
        Some(method(self, arg))
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address-based identity, stable for as long as the object is alive.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn downgrade(&self) -> WeakObjectRef {
        WeakObjectRef(Arc::downgrade(&self.0))
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.identity())
    }
}

/// Non-owning handle used by the object registry.
#[derive(Clone)]
pub struct WeakObjectRef(Weak<ObjectInner>);

impl WeakObjectRef {
    pub fn upgrade(&self) -> Option<ObjectRef> {
        self.0.upgrade().map(ObjectRef)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for WeakObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakObjectRef(alive: {})", self.is_alive())
    }
}
