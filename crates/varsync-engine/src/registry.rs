use std::collections::HashMap;

use parking_lot::Mutex;
use varsync_core::{ObjId, ObjectRef, WeakObjectRef};

/// Identity map from live backend objects to reference ids.
///
/// Entries hold weak references and disappear once the object is dropped,
/// either lazily on lookup or in bulk via [`ObjectRegistry::prune`]. One
/// registry belongs to one session. Serialization hands out engine ids
/// through a shared reference, hence the lock.
#[derive(Default)]
pub struct ObjectRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<ObjId, WeakObjectRef>,
    by_identity: HashMap<usize, ObjId>,
    last_negative: i64,
}

impl Inner {
    fn live_id(&mut self, obj: &ObjectRef) -> Option<ObjId> {
        let key = obj.identity();
        let id = *self.by_identity.get(&key)?;
        match self.by_id.get(&id).and_then(WeakObjectRef::upgrade) {
            Some(found) if found.ptr_eq(obj) => Some(id),
            _ => {
                // The address was reused by a new object after the old one died.
                self.by_identity.remove(&key);
                if self.by_id.get(&id).is_some_and(|w| !w.is_alive()) {
                    self.by_id.remove(&id);
                }
                None
            }
        }
    }

    fn insert(&mut self, obj: &ObjectRef, id: ObjId) {
        if let Some(previous) = self.by_id.insert(id, obj.downgrade()).and_then(|w| w.upgrade()) {
            self.by_identity.remove(&previous.identity());
        }
        self.by_identity.insert(obj.identity(), id);
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `obj` under `id`. An object that is already registered keeps
    /// its existing id, which is returned, so every path to it yields the
    /// same token. An id already held by a different object is reassigned.
    pub fn register(&self, obj: &ObjectRef, id: ObjId) -> ObjId {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.live_id(obj) {
            return existing;
        }
        inner.insert(obj, id);
        id
    }

    /// The id of a registered, live object.
    pub fn id_of(&self, obj: &ObjectRef) -> Option<ObjId> {
        self.inner.lock().live_id(obj)
    }

    /// The object's id, handing out a fresh engine-owned (negative) id if it
    /// has none yet.
    pub fn assign_engine_id(&self, obj: &ObjectRef) -> ObjId {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.live_id(obj) {
            return existing;
        }
        inner.last_negative -= 1;
        let id = ObjId(inner.last_negative);
        inner.insert(obj, id);
        id
    }

    pub fn get(&self, id: ObjId) -> Option<ObjectRef> {
        self.inner.lock().by_id.get(&id).and_then(WeakObjectRef::upgrade)
    }

    pub fn unregister(&self, id: ObjId) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_id.remove(&id) {
            Some(weak) => {
                if let Some(obj) = weak.upgrade() {
                    inner.by_identity.remove(&obj.identity());
                } else {
                    inner.by_identity.retain(|_, v| *v != id);
                }
                true
            }
            None => false,
        }
    }

    /// Drop entries whose objects have been collected. Returns how many.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.by_id.len();
        inner.by_id.retain(|_, weak| weak.is_alive());
        let Inner {
            by_id, by_identity, ..
        } = &mut *inner;
        by_identity.retain(|_, id| by_id.contains_key(id));
        before - by_id.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_object_keeps_first_id() {
        let registry = ObjectRegistry::new();
        let obj = ObjectRef::new();
        assert_eq!(registry.register(&obj, ObjId(4)), ObjId(4));
        assert_eq!(registry.register(&obj, ObjId(9)), ObjId(4));
        assert_eq!(registry.id_of(&obj), Some(ObjId(4)));
        assert!(registry.get(ObjId(9)).is_none());
    }

    #[test]
    fn id_reassigned_to_new_object() {
        let registry = ObjectRegistry::new();
        let a = ObjectRef::new();
        let b = ObjectRef::new();
        registry.register(&a, ObjId(4));
        registry.register(&b, ObjId(4));
        assert_eq!(registry.id_of(&a), None);
        assert_eq!(registry.id_of(&b), Some(ObjId(4)));
    }

    #[test]
    fn engine_ids_are_negative_and_stable() {
        let registry = ObjectRegistry::new();
        let a = ObjectRef::new();
        let b = ObjectRef::new();
        let id_a = registry.assign_engine_id(&a);
        let id_b = registry.assign_engine_id(&b);
        assert_eq!(id_a, ObjId(-1));
        assert_eq!(id_b, ObjId(-2));
        assert_eq!(registry.assign_engine_id(&a), id_a);
        assert!(id_a.is_engine_owned());
    }

    #[test]
    fn prune_removes_collected_objects() {
        let registry = ObjectRegistry::new();
        let keep = ObjectRef::new();
        let gone = ObjectRef::new();
        registry.register(&keep, ObjId(2));
        registry.register(&gone, ObjId(3));
        drop(gone);

        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(ObjId(3)).is_none());
        assert_eq!(registry.id_of(&keep), Some(ObjId(2)));
    }

    #[test]
    fn unregister_forgets_identity() {
        let registry = ObjectRegistry::new();
        let obj = ObjectRef::new();
        registry.register(&obj, ObjId(5));
        assert!(registry.unregister(ObjId(5)));
        assert!(!registry.unregister(ObjId(5)));
        assert_eq!(registry.id_of(&obj), None);
        assert!(registry.is_empty());
    }
}
