//! Owner index
//!
//! Reverse index from owned object to the Declaration controlling it, built
//! from the `controller: true` owner reference. Child events are translated
//! to Declaration keys through it; deletes need it because the last known
//! state of a deleted child may be all a watch delivers.

use crate::object::{ReconcileKey, ResourceKey, controller_owner, parse_gvk};
use kube::core::{DynamicObject, GroupVersionKind};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Owned object → controlling Declaration.
#[derive(Debug)]
pub struct OwnerIndex {
    owner_kind: GroupVersionKind,
    entries: RwLock<HashMap<ResourceKey, ReconcileKey>>,
}

impl OwnerIndex {
    /// Index of objects controlled by objects of `owner_kind`.
    #[must_use]
    pub fn new(owner_kind: GroupVersionKind) -> Self {
        Self {
            owner_kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Declaration named by `obj`'s controller reference, if it is of the
    /// owner kind. Owners share the owned object's namespace.
    #[must_use]
    pub fn resolve_owner(&self, obj: &DynamicObject) -> Option<ReconcileKey> {
        let owner = controller_owner(obj)?;
        let gvk = parse_gvk(&owner.api_version, &owner.kind);
        if gvk.group != self.owner_kind.group || gvk.kind != self.owner_kind.kind {
            return None;
        }
        let namespace = obj.metadata.namespace.as_deref().unwrap_or("default");
        Some(ReconcileKey::new(namespace, owner.name.clone()))
    }

    /// Records `obj` and returns its owner. Objects without a matching
    /// controller reference are dropped from the index.
    pub fn observe(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Option<ReconcileKey> {
        let key = ResourceKey::of(gvk, obj)?;
        let owner = self.resolve_owner(obj);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match &owner {
            Some(owner) => {
                entries.insert(key, owner.clone());
            }
            None => {
                entries.remove(&key);
            }
        }
        owner
    }

    /// Removes `obj` and returns the owner it was indexed under.
    pub fn forget(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Option<ReconcileKey> {
        let key = ResourceKey::of(gvk, obj)?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
    }

    /// Indexed owner of `key`.
    #[must_use]
    pub fn owner_of(&self, key: &ResourceKey) -> Option<ReconcileKey> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Indexed objects owned by `owner`.
    #[must_use]
    pub fn owned_by(&self, owner: &ReconcileKey) -> Vec<ResourceKey> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, indexed)| *indexed == owner)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of indexed objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
