use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use varsync_core::message::Properties;
use varsync_core::{Value, VarId};

/// Auxiliary object standing in for a variable's transmitted value.
///
/// An instance is created lazily the first time its variable resolves, is
/// owned by that variable, and is reused for every later value change.
pub trait Wrapper: Send + Sync {
    /// Produce the value to transmit (and to navigate from, for children)
    /// given the variable's freshly changed raw value.
    fn compute(&self, value: &Value) -> Value;

    /// Called once when the owning variable is destroyed.
    fn destroyed(&self) {}
}

/// What a factory sees when asked to build an instance.
pub struct WrapperContext {
    pub var_id: VarId,
    pub properties: Properties,
}

pub trait WrapperFactory: Send + Sync {
    fn create(&self, ctx: &WrapperContext) -> Arc<dyn Wrapper>;
}

impl<F> WrapperFactory for F
where
    F: Fn(&WrapperContext) -> Arc<dyn Wrapper> + Send + Sync,
{
    fn create(&self, ctx: &WrapperContext) -> Arc<dyn Wrapper> {
        self(ctx)
    }
}

/// Constructors keyed by the `wrapper` property value.
#[derive(Default)]
pub struct WrapperRegistry {
    factories: RwLock<HashMap<String, Arc<dyn WrapperFactory>>>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one under the same name.
    pub fn register(&self, name: impl Into<String>, factory: impl WrapperFactory + 'static) {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.factories.write().remove(name).is_some()
    }

    /// Resolve a name to its factory. Done once when a variable is created
    /// or its `wrapper` property changes.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn WrapperFactory>> {
        self.factories.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}
