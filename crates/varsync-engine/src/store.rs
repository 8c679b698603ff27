use std::collections::HashMap;

use varsync_core::message::Properties;
use varsync_core::{IdRange, ProtocolError, Value, VarId};

use crate::variable::{AppliedProperty, Variable};
use crate::wrapper::WrapperRegistry;

/// One session's variable tree.
#[derive(Debug)]
pub struct VariableStore {
    vars: HashMap<VarId, Variable>,
    standard_names: HashMap<String, VarId>,
    next_backend: VarId,
    next_frontend: VarId,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self {
            vars: HashMap::new(),
            standard_names: HashMap::new(),
            next_backend: IdRange::Backend.first(),
            next_frontend: IdRange::Frontend.first(),
        }
    }

    /// Next unused id in the given range.
    pub fn allocate(&mut self, range: IdRange) -> VarId {
        let next = match range {
            IdRange::Backend => &mut self.next_backend,
            IdRange::Frontend => &mut self.next_frontend,
        };
        while self.vars.contains_key(&*next) {
            next.0 += 1;
        }
        let id = *next;
        next.0 += 1;
        id
    }

    /// Insert a new variable under `parent_id`. The caller picks the id.
    pub fn create(
        &mut self,
        id: VarId,
        parent_id: Option<VarId>,
        value: Value,
    ) -> Result<VarId, ProtocolError> {
        if self.vars.contains_key(&id) {
            return Err(ProtocolError::InvalidId {
                id,
                reason: "already exists".into(),
            });
        }
        if let Some(parent) = parent_id {
            let parent_var = self
                .vars
                .get_mut(&parent)
                .ok_or(ProtocolError::NotFound(parent))?;
            parent_var.children.insert(id);
        }
        self.vars.insert(id, Variable::new(id, parent_id, value));
        Ok(id)
    }

    pub fn get(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(&id)
    }

    pub fn get_mut(&mut self, id: VarId) -> Option<&mut Variable> {
        self.vars.get_mut(&id)
    }

    pub fn contains(&self, id: VarId) -> bool {
        self.vars.contains_key(&id)
    }

    /// Apply a value (immediately, forcing a recompute) and then properties
    /// in priority order.
    pub fn update(
        &mut self,
        id: VarId,
        value: Option<Value>,
        properties: &Properties,
        wrappers: &WrapperRegistry,
    ) -> Result<Vec<AppliedProperty>, ProtocolError> {
        let var = self.vars.get_mut(&id).ok_or(ProtocolError::NotFound(id))?;
        if let Some(value) = value {
            var.set_value(value);
            var.invalidate();
        }
        var.apply_properties(properties, wrappers)
    }

    /// Remove a variable and all of its descendants, depth first. Returns
    /// the removed ids, descendants before ancestors.
    pub fn destroy(&mut self, id: VarId) -> Result<Vec<VarId>, ProtocolError> {
        let parent_id = self
            .vars
            .get(&id)
            .ok_or(ProtocolError::NotFound(id))?
            .parent_id;

        let mut removed = Vec::new();
        self.destroy_subtree(id, &mut removed);

        if let Some(parent) = parent_id.and_then(|p| self.vars.get_mut(&p)) {
            parent.children.remove(&id);
        }
        self.standard_names.retain(|_, var| !removed.contains(var));
        Ok(removed)
    }

    fn destroy_subtree(&mut self, id: VarId, removed: &mut Vec<VarId>) {
        let Some(mut var) = self.vars.remove(&id) else {
            return;
        };
        for child in std::mem::take(&mut var.children) {
            self.destroy_subtree(child, removed);
        }
        var.drop_wrapper();
        removed.push(id);
    }

    pub fn register_standard_name(&mut self, name: impl Into<String>, id: VarId) -> Result<(), ProtocolError> {
        if !self.vars.contains_key(&id) {
            return Err(ProtocolError::NotFound(id));
        }
        self.standard_names.insert(name.into(), id);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<VarId> {
        self.standard_names.get(name).copied()
    }

    pub fn children(&self, id: VarId) -> Vec<VarId> {
        self.vars
            .get(&id)
            .map(|v| v.children().collect())
            .unwrap_or_default()
    }

    /// All ids, ascending.
    pub fn ids(&self) -> Vec<VarId> {
        let mut ids: Vec<VarId> = self.vars.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
