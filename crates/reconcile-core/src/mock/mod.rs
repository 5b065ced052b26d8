//! In-memory object store for unit testing
//!
//! This module provides an implementation of `ObjectStore` that keeps objects
//! in memory, so the engine can be exercised without an API server. It runs
//! the same field-manager merge as the real thing, tracks resource versions
//! and generations, broadcasts watch events, garbage-collects controlled
//! objects on delete, and can be told to fail the next call of an operation.

mod recorder;

pub use recorder::{MockRecorder, RecordedEvent};

use crate::apply::{ManagedFields, merge_apply, replace_apply};
use crate::error::StoreError;
use crate::object::{LabelSelector, ResourceKey, is_controlled_by};
use crate::registry::TypeRegistry;
use crate::store::{ObjectStore, WatchEvent, WatchEventType, WatchStream};
use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Store operation, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    /// `ObjectStore::get`
    Get,
    /// `ObjectStore::list`
    List,
    /// `ObjectStore::apply`
    Apply,
    /// `ObjectStore::replace`
    Replace,
    /// `ObjectStore::update_status`
    UpdateStatus,
}

#[derive(Debug, Clone)]
struct Record {
    object: DynamicObject,
    managed: ManagedFields,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<ResourceKey, Record>,
    next_version: u64,
    failures: Vec<(StoreOp, StoreError)>,
    applies: usize,
    status_writes: usize,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_failure(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match self.failures.iter().position(|(failing, _)| *failing == op) {
            Some(index) => Err(self.failures.remove(index).1),
            None => Ok(()),
        }
    }
}

/// In-memory `ObjectStore`.
#[derive(Clone)]
pub struct MockObjectStore {
    registry: Arc<TypeRegistry>,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<(GroupVersionKind, WatchEvent)>,
}

impl fmt::Debug for MockObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockObjectStore")
            .field("objects", &self.lock().objects.len())
            .finish_non_exhaustive()
    }
}

fn invalid(e: impl fmt::Display) -> StoreError {
    StoreError::Invalid(e.to_string())
}

/// Everything but identity metadata and status; a change here bumps the
/// generation.
fn content(value: &Value) -> Value {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        map.remove("metadata");
        map.remove("status");
    }
    value
}

impl MockObjectStore {
    /// Create a new empty store validating objects against `registry`
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            registry,
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, gvk: &GroupVersionKind, event_type: WatchEventType, object: &DynamicObject) {
        // No receivers just means nobody is watching.
        let _ = self
            .events
            .send((gvk.clone(), WatchEvent::new(event_type, object.clone())));
    }

    fn key_of(&self, obj: &DynamicObject) -> Result<(GroupVersionKind, ResourceKey), StoreError> {
        let gvk = self.registry.validate(obj).map_err(invalid)?;
        let key = ResourceKey::of(&gvk, obj)
            .ok_or_else(|| StoreError::Invalid("object has no name".to_string()))?;
        Ok((gvk, key))
    }

    /// Creates an object as an external actor would, assigning uid, resource
    /// version and generation.
    pub fn insert(&self, mut obj: DynamicObject) -> Result<DynamicObject, StoreError> {
        let (gvk, key) = self.key_of(&obj)?;
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{key} already exists")));
        }
        obj.metadata
            .uid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        obj.metadata.generation.get_or_insert(1);
        obj.metadata.resource_version = Some(inner.next_version());
        inner.objects.insert(
            key,
            Record {
                object: obj.clone(),
                managed: ManagedFields::default(),
            },
        );
        drop(inner);
        self.emit(&gvk, WatchEventType::Added, &obj);
        Ok(obj)
    }

    /// Overwrites an object's status without a version check, the way another
    /// controller reporting on the object would.
    pub fn set_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        status: Value,
    ) -> Result<DynamicObject, StoreError> {
        let key = ResourceKey::new(gvk.clone(), namespace, name);
        let mut inner = self.lock();
        let version = inner.next_version();
        let record = inner
            .objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        set_status_field(&mut record.object, status);
        record.object.metadata.resource_version = Some(version);
        let obj = record.object.clone();
        drop(inner);
        self.emit(gvk, WatchEventType::Modified, &obj);
        Ok(obj)
    }

    /// Deletes an object, then every object it controls.
    pub fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        let key = ResourceKey::new(gvk.clone(), namespace, name);
        let (removed, collected) = {
            let mut inner = self.lock();
            let record = inner
                .objects
                .remove(&key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let uid = record.object.metadata.uid.clone().unwrap_or_default();
            let dependents: Vec<ResourceKey> = inner
                .objects
                .iter()
                .filter(|(_, dependent)| is_controlled_by(&dependent.object, &uid))
                .map(|(key, _)| key.clone())
                .collect();
            let collected: Vec<(GroupVersionKind, DynamicObject)> = dependents
                .into_iter()
                .filter_map(|key| {
                    let record = inner.objects.remove(&key)?;
                    Some((key.gvk, record.object))
                })
                .collect();
            (record.object, collected)
        };
        self.emit(gvk, WatchEventType::Deleted, &removed);
        for (gvk, obj) in &collected {
            self.emit(gvk, WatchEventType::Deleted, obj);
        }
        Ok(())
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.lock().failures.push((op, error));
    }

    /// Current state of an object.
    #[must_use]
    pub fn object(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let key = ResourceKey::new(gvk.clone(), namespace, name);
        self.lock().objects.get(&key).map(|record| record.object.clone())
    }

    /// Every stored object of `gvk`.
    #[must_use]
    pub fn objects(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|(key, _)| key.gvk == *gvk)
            .map(|(_, record)| record.object.clone())
            .collect()
    }

    /// Field ownership recorded for an object.
    #[must_use]
    pub fn managed_fields(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<ManagedFields> {
        let key = ResourceKey::new(gvk.clone(), namespace, name);
        self.lock().objects.get(&key).map(|record| record.managed.clone())
    }

    /// Number of apply calls that reached the store.
    #[must_use]
    pub fn apply_count(&self) -> usize {
        self.lock().applies
    }

    /// Number of successful status writes.
    #[must_use]
    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    fn write(
        inner: &mut Inner,
        key: ResourceKey,
        merged: Value,
        managed: ManagedFields,
        live: Option<&DynamicObject>,
    ) -> Result<(DynamicObject, WatchEventType), StoreError> {
        let mut obj: DynamicObject = serde_json::from_value(merged).map_err(invalid)?;
        let event_type = match live {
            None => {
                obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
                obj.metadata.generation = Some(1);
                WatchEventType::Added
            }
            Some(live) => {
                obj.metadata.uid.clone_from(&live.metadata.uid);
                let before = serde_json::to_value(live).map_err(invalid)?;
                let after = serde_json::to_value(&obj).map_err(invalid)?;
                let generation = live.metadata.generation.unwrap_or(1);
                obj.metadata.generation = Some(if content(&before) == content(&after) {
                    generation
                } else {
                    generation + 1
                });
                WatchEventType::Modified
            }
        };

        obj.metadata.resource_version = Some(inner.next_version());
        inner.objects.insert(
            key,
            Record {
                object: obj.clone(),
                managed,
            },
        );
        Ok((obj, event_type))
    }

    fn check_kind(expected: &GroupVersionKind, actual: &GroupVersionKind) -> Result<(), StoreError> {
        if expected == actual {
            Ok(())
        } else {
            Err(StoreError::Invalid(format!(
                "object is a {}, not a {}",
                actual.kind, expected.kind
            )))
        }
    }
}

fn set_status_field(obj: &mut DynamicObject, status: Value) {
    if let Value::Object(map) = &mut obj.data {
        map.insert("status".to_string(), status);
    } else {
        obj.data = serde_json::json!({ "status": status });
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let mut inner = self.lock();
        inner.take_failure(StoreOp::Get)?;
        let key = ResourceKey::new(gvk.clone(), namespace, name);
        Ok(inner.objects.get(&key).map(|record| record.object.clone()))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let mut inner = self.lock();
        inner.take_failure(StoreOp::List)?;
        let mut objects: Vec<DynamicObject> = inner
            .objects
            .iter()
            .filter(|(key, _)| key.gvk == *gvk)
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace.as_deref() == Some(ns)))
            .filter(|(_, record)| selector.matches(record.object.metadata.labels.as_ref()))
            .map(|(_, record)| record.object.clone())
            .collect();
        objects.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(objects)
    }

    async fn apply(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
        field_manager: &str,
        force: bool,
    ) -> Result<DynamicObject, StoreError> {
        let (actual, key) = self.key_of(obj)?;
        Self::check_kind(gvk, &actual)?;
        let desired = serde_json::to_value(obj).map_err(invalid)?;

        // One guard across read, merge and write.
        let (stored, event_type) = {
            let mut inner = self.lock();
            inner.take_failure(StoreOp::Apply)?;
            inner.applies += 1;

            let live = inner.objects.get(&key).cloned();
            let live_value = live
                .as_ref()
                .map(|record| serde_json::to_value(&record.object))
                .transpose()
                .map_err(invalid)?;
            let managed = live
                .as_ref()
                .map(|record| record.managed.clone())
                .unwrap_or_default();

            let outcome =
                merge_apply(live_value.as_ref(), &managed, &desired, field_manager, force)?;
            if !outcome.changed {
                if let Some(record) = live {
                    return Ok(record.object);
                }
            }
            Self::write(
                &mut inner,
                key,
                outcome.object,
                outcome.managed,
                live.as_ref().map(|record| &record.object),
            )?
        };
        self.emit(gvk, event_type, &stored);
        Ok(stored)
    }

    async fn replace(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, StoreError> {
        let (actual, key) = self.key_of(obj)?;
        Self::check_kind(gvk, &actual)?;
        let desired = serde_json::to_value(obj).map_err(invalid)?;

        let (stored, event_type) = {
            let mut inner = self.lock();
            inner.take_failure(StoreOp::Replace)?;

            let live = inner.objects.get(&key).cloned();
            if let (Some(record), Some(version)) = (&live, &obj.metadata.resource_version) {
                if record.object.metadata.resource_version.as_ref() != Some(version) {
                    return Err(StoreError::Conflict(format!(
                        "{key} was modified (have {version})"
                    )));
                }
            }
            let live_value = live
                .as_ref()
                .map(|record| serde_json::to_value(&record.object))
                .transpose()
                .map_err(invalid)?;
            let outcome = replace_apply(live_value.as_ref(), &desired, field_manager);
            if !outcome.changed {
                if let Some(record) = live {
                    return Ok(record.object);
                }
            }
            Self::write(
                &mut inner,
                key,
                outcome.object,
                outcome.managed,
                live.as_ref().map(|record| &record.object),
            )?
        };
        self.emit(gvk, event_type, &stored);
        Ok(stored)
    }

    async fn update_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
        resource_version: Option<&str>,
    ) -> Result<DynamicObject, StoreError> {
        let key = ResourceKey::new(gvk.clone(), namespace, name);
        let obj = {
            let mut inner = self.lock();
            inner.take_failure(StoreOp::UpdateStatus)?;
            let version = inner.next_version();
            let record = inner
                .objects
                .get_mut(&key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if let Some(expected) = resource_version {
                if record.object.metadata.resource_version.as_deref() != Some(expected) {
                    return Err(StoreError::Conflict(format!(
                        "{key} was modified (have {expected})"
                    )));
                }
            }
            set_status_field(&mut record.object, status.clone());
            record.object.metadata.resource_version = Some(version);
            let obj = record.object.clone();
            inner.status_writes += 1;
            obj
        };
        self.emit(gvk, WatchEventType::Modified, &obj);
        Ok(obj)
    }

    fn watch(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> WatchStream {
        let receiver = self.events.subscribe();
        let gvk = gvk.clone();
        let namespace = namespace.map(str::to_string);
        Box::pin(futures::stream::unfold(receiver, move |mut receiver| {
            let gvk = gvk.clone();
            let namespace = namespace.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((kind, event)) => {
                            let in_scope = namespace
                                .as_deref()
                                .is_none_or(|ns| event.object.metadata.namespace.as_deref() == Some(ns));
                            if kind == gvk && in_scope {
                                return Some((Ok(event), receiver));
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            let error =
                                StoreError::Transport(format!("watch fell behind by {missed} events"));
                            return Some((Err(error), receiver));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::gvk_of;
    use crds::Declaration;
    use futures::StreamExt;
    use k8s_openapi::api::apps::v1::Deployment;
    use serde_json::json;

    fn store() -> MockObjectStore {
        MockObjectStore::new(Arc::new(
            TypeRegistry::builder()
                .register::<Declaration>()
                .register::<Deployment>()
                .build(),
        ))
    }

    fn deployment_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "Deployment")
    }

    fn deployment(replicas: i64) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"containers": [{"name": "main", "image": "nginx:1.25"}]}
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_tracks_versions_and_generation() {
        let store = store();
        let created = store.apply(&deployment_gvk(), &deployment(1), "ctrl", false).await.unwrap();
        assert_eq!(created.metadata.generation, Some(1));
        assert!(created.metadata.uid.is_some());

        let same = store.apply(&deployment_gvk(), &deployment(1), "ctrl", false).await.unwrap();
        assert_eq!(same.metadata.resource_version, created.metadata.resource_version);

        let scaled = store.apply(&deployment_gvk(), &deployment(3), "ctrl", false).await.unwrap();
        assert_eq!(scaled.metadata.generation, Some(2));
        assert_eq!(scaled.metadata.uid, created.metadata.uid);
        assert_ne!(scaled.metadata.resource_version, created.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_apply_rejects_invalid_objects() {
        let store = store();
        let mut bad = deployment(1);
        bad.data["spec"]["replicas"] = json!("three");
        let err = store.apply(&deployment_gvk(), &bad, "ctrl", false).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_replace_rejects_stale_version() {
        let store = store();
        let created = store.replace(&deployment_gvk(), &deployment(1), "ctrl").await.unwrap();
        assert_eq!(created.metadata.generation, Some(1));

        let mut scaled = deployment(2);
        scaled.metadata.resource_version = created.metadata.resource_version.clone();
        let scaled = store.replace(&deployment_gvk(), &scaled, "ctrl").await.unwrap();
        assert_eq!(scaled.metadata.generation, Some(2));

        let mut stale = deployment(3);
        stale.metadata.resource_version = created.metadata.resource_version.clone();
        let err = store.replace(&deployment_gvk(), &stale, "ctrl").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let live = store.object(&deployment_gvk(), Some("default"), "web").unwrap();
        assert_eq!(live.data["spec"]["replicas"], json!(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_applies_do_not_lose_updates() {
        for _ in 0..20 {
            let store = store();
            let (a, b) = tokio::join!(
                tokio::spawn({
                    let store = store.clone();
                    async move { store.apply(&deployment_gvk(), &deployment(2), "a", false).await }
                }),
                tokio::spawn({
                    let store = store.clone();
                    async move { store.apply(&deployment_gvk(), &deployment(3), "b", false).await }
                }),
            );
            let (a, b) = (a.unwrap(), b.unwrap());

            // Whoever lands second sees the first one's replicas and conflicts.
            assert!(a.is_ok() != b.is_ok(), "exactly one apply should win");
            let winner = if a.is_ok() { json!(2) } else { json!(3) };
            let loser = a.err().or(b.err()).unwrap();
            assert!(matches!(loser, StoreError::FieldConflict(_)));

            let live = store.object(&deployment_gvk(), Some("default"), "web").unwrap();
            assert_eq!(live.data["spec"]["replicas"], winner);
            assert_eq!(live.metadata.generation, Some(1));
            assert_eq!(store.apply_count(), 2);
        }
    }

    #[tokio::test]
    async fn test_update_status_checks_version() {
        let store = store();
        let decl = store
            .insert(
                serde_json::from_value(json!({
                    "apiVersion": "mygroup.example.com/v1alpha1",
                    "kind": "Declaration",
                    "metadata": {"name": "nginx", "namespace": "default"},
                    "spec": {"image": "nginx:1.25"}
                }))
                .unwrap(),
            )
            .unwrap();
        let gvk = gvk_of(&decl).unwrap();
        let status = json!({"state": "Building"});

        let err = store
            .update_status(&gvk, Some("default"), "nginx", &status, Some("stale"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let updated = store
            .update_status(
                &gvk,
                Some("default"),
                "nginx",
                &status,
                decl.metadata.resource_version.as_deref(),
            )
            .await
            .unwrap();
        assert_eq!(updated.data["status"], status);
        assert_eq!(updated.data["spec"]["image"], json!("nginx:1.25"));
        assert_eq!(updated.metadata.generation, decl.metadata.generation);
        assert_eq!(store.status_writes(), 1);

        let missing = store
            .update_status(&gvk, Some("default"), "absent", &status, None)
            .await
            .unwrap_err();
        assert!(matches!(missing, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_watch_and_failure_injection() {
        let store = store();
        let mut watch = store.watch(&deployment_gvk(), Some("default"));
        store.apply(&deployment_gvk(), &deployment(1), "ctrl", false).await.unwrap();
        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, WatchEventType::Added);

        store.fail_next(StoreOp::Get, StoreError::Transport("connection reset".into()));
        assert!(store.get(&deployment_gvk(), Some("default"), "web").await.is_err());
        assert!(store.get(&deployment_gvk(), Some("default"), "web").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_collects_dependents() {
        let store = store();
        let decl = store
            .insert(
                serde_json::from_value(json!({
                    "apiVersion": "mygroup.example.com/v1alpha1",
                    "kind": "Declaration",
                    "metadata": {"name": "nginx", "namespace": "default"},
                    "spec": {"image": "nginx:1.25"}
                }))
                .unwrap(),
            )
            .unwrap();
        let decl_gvk = gvk_of(&decl).unwrap();
        let mut child = deployment(1);
        child.metadata.owner_references = Some(vec![
            crate::object::controller_reference(&decl, &decl_gvk).unwrap(),
        ]);
        store.apply(&deployment_gvk(), &child, "ctrl", false).await.unwrap();

        store.delete(&decl_gvk, Some("default"), "nginx").unwrap();
        assert!(store.objects(&deployment_gvk()).is_empty());
        assert!(store.object(&decl_gvk, Some("default"), "nginx").is_none());
    }
}
