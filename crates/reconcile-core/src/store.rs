//! Object store trait
//!
//! The engine never talks to an API server directly. Everything it reads or
//! writes goes through `ObjectStore`, which the hosting process implements on
//! top of its client and tests implement in memory.

use crate::error::StoreError;
use crate::object::LabelSelector;
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::Value;

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    /// Object created, or seen during the initial listing
    Added,
    /// Object changed
    Modified,
    /// Object removed
    Deleted,
}

/// A single watch notification.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// What happened
    pub event_type: WatchEventType,
    /// Object state after the change (last known state for deletes)
    pub object: DynamicObject,
}

impl WatchEvent {
    /// Builds an event.
    #[must_use]
    pub fn new(event_type: WatchEventType, object: DynamicObject) -> Self {
        Self { event_type, object }
    }
}

/// Stream of watch notifications. Ends or yields an error when the watch
/// breaks; callers re-open it.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Logical operations against the backing object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches one object. `Ok(None)` when it does not exist.
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError>;

    /// Lists objects of a kind matching `selector`, across all namespaces when
    /// `namespace` is `None`.
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    /// Merge-applies `obj` as `field_manager`. With `force`, contested fields
    /// are taken over instead of failing with a field conflict.
    async fn apply(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
        field_manager: &str,
        force: bool,
    ) -> Result<DynamicObject, StoreError>;

    /// Replaces the whole object, creating it when absent. The object's
    /// resource version, when set, must match the stored one.
    async fn replace(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, StoreError>;

    /// Writes only the status subresource. Fails with `Conflict` when
    /// `resource_version` is set and stale.
    async fn update_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
        resource_version: Option<&str>,
    ) -> Result<DynamicObject, StoreError>;

    /// Opens a watch on a kind.
    fn watch(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> WatchStream;
}
