use std::collections::BTreeSet;
use std::sync::Arc;

use varsync_core::message::Properties;
use varsync_core::priority::split_priority;
use varsync_core::{Path, Priority, ProtocolError, Value, VarId};

use crate::wrapper::{Wrapper, WrapperContext, WrapperFactory, WrapperRegistry};

pub const PROP_PATH: &str = "path";
pub const PROP_WRAPPER: &str = "wrapper";
pub const PROP_ACCESS: &str = "access";

/// Fail the same way [`Variable::apply_properties`] would, without touching
/// anything. Only an unknown wrapper name can make a property set fail.
pub fn validate_properties(changes: &Properties, wrappers: &WrapperRegistry) -> Result<(), ProtocolError> {
    for (key, value) in changes {
        let (name, _) = split_priority(key);
        if name == PROP_WRAPPER && !value.is_empty() && !wrappers.contains(value) {
            return Err(ProtocolError::UnknownWrapper(value.clone()));
        }
    }
    Ok(())
}

/// A property change as it was applied, with the priority it arrived under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedProperty {
    pub name: String,
    pub value: String,
    pub priority: Priority,
}

/// A node in one session's variable tree.
pub struct Variable {
    pub id: VarId,
    pub parent_id: Option<VarId>,
    pub(crate) children: BTreeSet<VarId>,
    properties: Properties,
    path: Option<Path>,
    /// Directly assigned value, used when the variable has no path.
    value: Value,
    /// Serialized snapshot of the last computed raw value.
    monitored: Option<serde_json::Value>,
    /// Transmitted form: the raw value, or the wrapper's output.
    stored: Value,
    wrapper_factory: Option<Arc<dyn WrapperFactory>>,
    wrapper: Option<Arc<dyn Wrapper>>,
    pub watch_count: usize,
    /// Not relayed to an external backend.
    pub unbound: bool,
}

impl Variable {
    pub fn new(id: VarId, parent_id: Option<VarId>, value: Value) -> Self {
        Self {
            id,
            parent_id,
            children: BTreeSet::new(),
            properties: Properties::new(),
            path: None,
            value,
            monitored: None,
            stored: Value::Null,
            wrapper_factory: None,
            wrapper: None,
            watch_count: 0,
            unbound: false,
        }
    }

    pub fn children(&self) -> impl Iterator<Item = VarId> + '_ {
        self.children.iter().copied()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_ref()
    }

    pub fn is_read_only(&self) -> bool {
        self.property(PROP_ACCESS) == Some("r")
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn monitored(&self) -> Option<&serde_json::Value> {
        self.monitored.as_ref()
    }

    pub fn stored(&self) -> &Value {
        &self.stored
    }

    /// Record a freshly computed raw value. The stored form is recomputed
    /// only when the snapshot differs structurally from the previous one.
    /// Returns whether it was recomputed.
    pub fn observe(&mut self, raw: Value, snapshot: serde_json::Value) -> bool {
        if self.monitored.as_ref() == Some(&snapshot) {
            return false;
        }
        self.monitored = Some(snapshot);
        self.stored = match self.wrapper_instance() {
            Some(wrapper) => wrapper.compute(&raw),
            None => raw,
        };
        true
    }

    /// Forget the snapshot so the next observation recomputes.
    pub fn invalidate(&mut self) {
        self.monitored = None;
    }

    pub fn has_wrapper(&self) -> bool {
        self.wrapper_factory.is_some()
    }

    /// The wrapper instance, constructed on first use.
    pub fn wrapper_instance(&mut self) -> Option<Arc<dyn Wrapper>> {
        if self.wrapper.is_none() {
            let factory = self.wrapper_factory.as_ref()?;
            let instance = factory.create(&WrapperContext {
                var_id: self.id,
                properties: self.properties.clone(),
            });
            self.wrapper = Some(instance);
        }
        self.wrapper.clone()
    }

    /// The instance if one has been constructed, without constructing it.
    pub fn existing_wrapper(&self) -> Option<&Arc<dyn Wrapper>> {
        self.wrapper.as_ref()
    }

    /// Apply property changes in priority order (high, medium, low), then
    /// by name. An empty value removes the property. Suffixes are stripped
    /// from the stored keys.
    ///
    /// An unknown `wrapper` name is rejected before anything is applied.
    pub fn apply_properties(
        &mut self,
        changes: &Properties,
        wrappers: &WrapperRegistry,
    ) -> Result<Vec<AppliedProperty>, ProtocolError> {
        let mut ordered: Vec<AppliedProperty> = changes
            .iter()
            .map(|(key, value)| {
                let (name, priority) = split_priority(key);
                AppliedProperty {
                    name: name.to_string(),
                    value: value.clone(),
                    priority,
                }
            })
            .collect();
        ordered.sort_by_key(|p| p.priority);

        let mut new_factory = None;
        if let Some(p) = ordered.iter().find(|p| p.name == PROP_WRAPPER && !p.value.is_empty()) {
            new_factory = Some(
                wrappers
                    .resolve(&p.value)
                    .ok_or_else(|| ProtocolError::UnknownWrapper(p.value.clone()))?,
            );
        }

        for p in &ordered {
            if p.value.is_empty() {
                self.properties.remove(&p.name);
            } else {
                self.properties.insert(p.name.clone(), p.value.clone());
            }
            match p.name.as_str() {
                PROP_PATH => {
                    self.path = (!p.value.is_empty()).then(|| Path::parse(&p.value));
                    self.monitored = None;
                }
                PROP_WRAPPER => {
                    self.drop_wrapper();
                    self.wrapper_factory = new_factory.take();
                    self.monitored = None;
                }
                _ => {}
            }
        }
        Ok(ordered)
    }

    /// Release the wrapper instance, notifying it.
    pub(crate) fn drop_wrapper(&mut self) {
        if let Some(wrapper) = self.wrapper.take() {
            wrapper.destroyed();
        }
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("properties", &self.properties)
            .field("watch_count", &self.watch_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn properties_apply_in_priority_order() {
        let mut var = Variable::new(VarId(2), Some(VarId::ROOT), Value::Null);
        let applied = var
            .apply_properties(
                &props(&[("a:low", "1"), ("b", "2"), ("type:high", "Contact")]),
                &WrapperRegistry::new(),
            )
            .unwrap();
        let names: Vec<&str> = applied.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["type", "b", "a"]);
        assert_eq!(var.property("type"), Some("Contact"));
        assert_eq!(var.property("type:high"), None);
    }

    #[test]
    fn empty_value_removes_property() {
        let mut var = Variable::new(VarId(2), None, Value::Null);
        let wrappers = WrapperRegistry::new();
        var.apply_properties(&props(&[("path", "name")]), &wrappers).unwrap();
        assert!(var.path().is_some());
        var.apply_properties(&props(&[("path", "")]), &wrappers).unwrap();
        assert!(var.path().is_none());
        assert_eq!(var.property("path"), None);
    }

    #[test]
    fn unknown_wrapper_rejects_whole_change() {
        let mut var = Variable::new(VarId(2), None, Value::Null);
        let err = var
            .apply_properties(&props(&[("wrapper", "Nope"), ("type", "x")]), &WrapperRegistry::new())
            .unwrap_err();
        assert_eq!(err.code(), "unknown-wrapper");
        assert_eq!(var.property("type"), None);
    }

    struct Counting(Arc<AtomicUsize>);

    impl Wrapper for Counting {
        fn compute(&self, value: &Value) -> Value {
            self.0.fetch_add(1, Ordering::SeqCst);
            value.clone()
        }
    }

    #[test]
    fn observe_recomputes_only_on_structural_change() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wrappers = WrapperRegistry::new();
        let counter = Arc::clone(&calls);
        wrappers.register("count", move |_: &WrapperContext| {
            Arc::new(Counting(Arc::clone(&counter))) as Arc<dyn Wrapper>
        });

        let mut var = Variable::new(VarId(2), None, Value::Null);
        var.apply_properties(&props(&[("wrapper", "count")]), &wrappers).unwrap();
        assert!(var.existing_wrapper().is_none());

        assert!(var.observe(Value::from(1i64), serde_json::json!(1)));
        assert!(!var.observe(Value::from(1i64), serde_json::json!(1)));
        assert!(var.observe(Value::from(2i64), serde_json::json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(var.stored(), &Value::from(2i64));
    }

    #[test]
    fn read_only_access() {
        let mut var = Variable::new(VarId(2), None, Value::Null);
        var.apply_properties(&props(&[("access", "r")]), &WrapperRegistry::new())
            .unwrap();
        assert!(var.is_read_only());
    }
}
