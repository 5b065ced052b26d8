//! Apply engine
//!
//! Field-manager merge semantics for owned objects. Each manager owns a set of
//! leaf paths in an object. Applying a desired object as a manager:
//!
//! * writes every leaf of the desired object,
//! * fails with [`ApplyConflict`] when a leaf is owned by another manager and
//!   the live value differs, unless `force` is set, in which case ownership
//!   moves to the applying manager,
//! * shares ownership when the live value already equals the desired one,
//! * removes leaves this manager applied before but no longer applies, unless
//!   someone else still owns them.
//!
//! Objects are recursed into; arrays and scalars are atomic leaves. Under
//! `metadata` only labels, annotations and owner references are managed, and
//! `status` is never touched.
//!
//! [`merge_apply`] is pure so stores can share it; [`ApplyEngine`] binds it to
//! an [`ObjectStore`] and a field manager.

use crate::document::lookup;
use crate::error::StoreError;
use crate::object::gvk_of;
use crate::store::ObjectStore;
use kube::core::DynamicObject;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Dot-joined path to a managed leaf.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Builds a path from segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.starts_with(&self.0)
    }

    /// True when one path is a prefix of the other.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::new(path.split('.'))
    }
}

/// Set of leaf paths owned by one manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet(BTreeSet<FieldPath>);

impl FieldSet {
    /// Leaf paths of an applied object.
    #[must_use]
    pub fn from_value(desired: &Value) -> Self {
        let mut set = BTreeSet::new();
        let Some(root) = desired.as_object() else {
            return Self(set);
        };
        for (key, value) in root {
            match key.as_str() {
                "apiVersion" | "kind" | "status" => {}
                "metadata" => collect_metadata(value, &mut set),
                _ => collect(&FieldPath::new([key.as_str()]), value, &mut set),
            }
        }
        Self(set)
    }

    /// True when any owned path overlaps `path`.
    #[must_use]
    pub fn overlaps(&self, path: &FieldPath) -> bool {
        self.0.iter().any(|owned| owned.overlaps(path))
    }

    /// Owned paths overlapping `path`.
    fn overlapping(&self, path: &FieldPath) -> Vec<FieldPath> {
        self.0
            .iter()
            .filter(|owned| owned.overlaps(path))
            .cloned()
            .collect()
    }

    /// True when `path` is owned exactly.
    #[must_use]
    pub fn contains(&self, path: &FieldPath) -> bool {
        self.0.contains(path)
    }

    /// Iterates the owned paths in order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.0.iter()
    }

    /// Number of owned paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing is owned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn remove(&mut self, path: &FieldPath) {
        self.0.remove(path);
    }
}

fn collect(prefix: &FieldPath, value: &Value, out: &mut BTreeSet<FieldPath>) {
    match value {
        Value::Null => {}
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                collect(&prefix.child(key), child, out);
            }
        }
        _ => {
            out.insert(prefix.clone());
        }
    }
}

fn collect_metadata(metadata: &Value, out: &mut BTreeSet<FieldPath>) {
    let Some(metadata) = metadata.as_object() else {
        return;
    };
    for map_key in ["labels", "annotations"] {
        if let Some(entries) = metadata.get(map_key).and_then(Value::as_object) {
            for (key, value) in entries {
                if !value.is_null() {
                    out.insert(FieldPath::new(["metadata", map_key, key.as_str()]));
                }
            }
        }
    }
    if metadata
        .get("ownerReferences")
        .is_some_and(|refs| !refs.is_null())
    {
        out.insert(FieldPath::new(["metadata", "ownerReferences"]));
    }
}

/// Field ownership of one object, by manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedFields(BTreeMap<String, FieldSet>);

impl ManagedFields {
    /// Fields owned by `manager`.
    #[must_use]
    pub fn get(&self, manager: &str) -> Option<&FieldSet> {
        self.0.get(manager)
    }

    /// Managers with at least one owned field.
    pub fn managers(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Replaces the fields owned by `manager`.
    pub fn set(&mut self, manager: impl Into<String>, fields: FieldSet) {
        let manager = manager.into();
        if fields.is_empty() {
            self.0.remove(&manager);
        } else {
            self.0.insert(manager, fields);
        }
    }

    fn others<'a>(&'a self, manager: &'a str) -> impl Iterator<Item = (&'a String, &'a FieldSet)> {
        self.0.iter().filter(move |(name, _)| name.as_str() != manager)
    }
}

/// One contested field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldConflict {
    /// Path the applying manager wanted to set
    pub path: FieldPath,
    /// Manager that currently owns it
    pub manager: String,
}

/// Apply failed because other managers own contested fields.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Apply as {field_manager} conflicts on {}", describe_conflicts(.conflicts))]
pub struct ApplyConflict {
    /// Manager that attempted the apply
    pub field_manager: String,
    /// Every contested field and its owner
    pub conflicts: Vec<FieldConflict>,
}

fn describe_conflicts(conflicts: &[FieldConflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} (owned by {})", c.path, c.manager))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result of merging a desired object into the live one.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Merged object
    pub object: Value,
    /// Field ownership after the merge
    pub managed: ManagedFields,
    /// True when the object or its ownership changed
    pub changed: bool,
}

fn set_at(root: &mut Value, path: &FieldPath, value: Value) {
    let Some((last, parents)) = path.segments().split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}

fn remove_at(root: &mut Value, path: &FieldPath) {
    let Some((last, parents)) = path.segments().split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        match current.as_object_mut().and_then(|map| map.get_mut(segment)) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(last);
    }
}

/// Copies identity fields the field sets do not cover.
fn copy_identity(target: &mut Value, desired: &Value) {
    for key in ["apiVersion", "kind"] {
        if let Some(value) = desired.get(key) {
            set_at(target, &FieldPath::new([key]), value.clone());
        }
    }
    for key in ["name", "namespace", "generateName"] {
        let path = FieldPath::new(["metadata", key]);
        if lookup(target, path.segments()).is_none() {
            if let Some(value) = lookup(desired, path.segments()) {
                set_at(target, &path, value.clone());
            }
        }
    }
}

/// Merges `desired` into `live` as `manager`.
///
/// `live` is `None` when the object does not exist yet.
pub fn merge_apply(
    live: Option<&Value>,
    managed: &ManagedFields,
    desired: &Value,
    manager: &str,
    force: bool,
) -> Result<MergeOutcome, ApplyConflict> {
    let applied = FieldSet::from_value(desired);
    let mut object = live.cloned().unwrap_or_else(|| Value::Object(Map::new()));
    let mut ownership = managed.clone();

    let mut conflicts = Vec::new();
    let mut taken: Vec<(String, FieldPath)> = Vec::new();
    for path in applied.iter() {
        let wanted = lookup(desired, path.segments());
        let current = lookup(&object, path.segments());
        if wanted == current {
            continue;
        }
        for (other, fields) in ownership.others(manager) {
            for contested in fields.overlapping(path) {
                conflicts.push(FieldConflict {
                    path: path.clone(),
                    manager: other.clone(),
                });
                taken.push((other.clone(), contested));
            }
        }
    }

    if !conflicts.is_empty() {
        if !force {
            return Err(ApplyConflict {
                field_manager: manager.to_string(),
                conflicts,
            });
        }
        for (other, path) in taken {
            if let Some(fields) = ownership.0.get_mut(&other) {
                fields.remove(&path);
                if fields.is_empty() {
                    ownership.0.remove(&other);
                }
            }
        }
    }

    if let Some(previous) = managed.get(manager) {
        for path in previous.iter() {
            if applied.overlaps(path) {
                continue;
            }
            if ownership.others(manager).any(|(_, fields)| fields.overlaps(path)) {
                continue;
            }
            remove_at(&mut object, path);
        }
    }

    for path in applied.iter() {
        if let Some(value) = lookup(desired, path.segments()) {
            set_at(&mut object, path, value.clone());
        }
    }
    copy_identity(&mut object, desired);
    ownership.set(manager, applied);

    let changed = live != Some(&object) || &ownership != managed;
    Ok(MergeOutcome {
        object,
        managed: ownership,
        changed,
    })
}

/// Whole-object overwrite: the desired object replaces the live one, keeping
/// only the live status and server-assigned metadata, and `manager` becomes
/// the sole owner.
#[must_use]
pub fn replace_apply(live: Option<&Value>, desired: &Value, manager: &str) -> MergeOutcome {
    let mut object = desired.clone();
    if let Some(status) = live.and_then(|live| live.get("status")) {
        set_at(&mut object, &FieldPath::new(["status"]), status.clone());
    } else {
        remove_at(&mut object, &FieldPath::new(["status"]));
    }
    for key in ["uid", "resourceVersion", "generation", "creationTimestamp"] {
        let path = FieldPath::new(["metadata", key]);
        match live.and_then(|live| lookup(live, path.segments())) {
            Some(value) => set_at(&mut object, &path, value.clone()),
            None => remove_at(&mut object, &path),
        }
    }
    let mut ownership = ManagedFields::default();
    ownership.set(manager, FieldSet::from_value(desired));
    MergeOutcome {
        changed: live != Some(&object),
        object,
        managed: ownership,
    }
}

/// How rendered objects are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
    /// Field-manager merge
    #[default]
    Merge,
    /// Whole-object replace; only for objects the controller owns end to end
    Replace,
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => f.write_str("merge"),
            Self::Replace => f.write_str("replace"),
        }
    }
}

impl std::str::FromStr for ApplyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "merge" | "apply" => Ok(Self::Merge),
            "replace" => Ok(Self::Replace),
            other => Err(format!("unknown apply mode '{other}', expected merge or replace")),
        }
    }
}

/// Writes rendered objects to a store as one field manager.
pub struct ApplyEngine {
    store: Arc<dyn ObjectStore>,
    field_manager: String,
    force: bool,
    mode: ApplyMode,
}

impl fmt::Debug for ApplyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyEngine")
            .field("field_manager", &self.field_manager)
            .field("force", &self.force)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ApplyEngine {
    /// Creates a merge-mode engine.
    pub fn new(store: Arc<dyn ObjectStore>, field_manager: impl Into<String>, force: bool) -> Self {
        Self {
            store,
            field_manager: field_manager.into(),
            force,
            mode: ApplyMode::Merge,
        }
    }

    /// Switches the write mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ApplyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Field manager this engine applies as.
    #[must_use]
    pub fn field_manager(&self) -> &str {
        &self.field_manager
    }

    /// Whether contested fields are taken over.
    #[must_use]
    pub fn force(&self) -> bool {
        self.force
    }

    /// How objects are written.
    #[must_use]
    pub fn mode(&self) -> ApplyMode {
        self.mode
    }

    /// Writes one rendered object and returns the stored result.
    pub async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        self.apply_with(obj, self.force).await
    }

    /// Like [`ApplyEngine::apply`], overriding the engine's `force` flag.
    /// Replace mode ignores it.
    pub async fn apply_with(
        &self,
        obj: &DynamicObject,
        force: bool,
    ) -> Result<DynamicObject, StoreError> {
        let gvk = gvk_of(obj)
            .ok_or_else(|| StoreError::Invalid("object has no apiVersion/kind".to_string()))?;
        let name = obj.metadata.name.as_deref().unwrap_or_default();
        debug!(
            kind = %gvk.kind,
            name,
            field_manager = %self.field_manager,
            mode = ?self.mode,
            force,
            "Applying object"
        );

        let result = match self.mode {
            ApplyMode::Merge => {
                self.store
                    .apply(&gvk, obj, &self.field_manager, force)
                    .await
            }
            ApplyMode::Replace => {
                let live = self
                    .store
                    .get(&gvk, obj.metadata.namespace.as_deref(), name)
                    .await?;
                let mut obj = obj.clone();
                obj.metadata.resource_version =
                    live.and_then(|live| live.metadata.resource_version);
                self.store.replace(&gvk, &obj, &self.field_manager).await
            }
        };

        if let Err(StoreError::FieldConflict(conflict)) = &result {
            for c in &conflict.conflicts {
                warn!(
                    kind = %gvk.kind,
                    name,
                    path = %c.path,
                    owner = %c.manager,
                    "Field owned by another manager"
                );
            }
        }
        result
    }
}
