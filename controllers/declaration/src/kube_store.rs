//! Object store backed by the Kubernetes API server.
//!
//! Every kind goes through `Api<DynamicObject>`, with the `ApiResource`
//! looked up in the type registry. Apply is server-side apply, so field
//! ownership and conflict detection happen on the server.

use async_trait::async_trait;
use futures::{StreamExt, stream};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::Client;
use kube_runtime::watcher;
use reconcile_core::object::type_meta;
use reconcile_core::{
    LabelSelector, ObjectStore, StoreError, TypeRegistry, WatchEvent, WatchEventType, WatchStream,
};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// `ObjectStore` implementation over a kube client.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: Arc<TypeRegistry>,
}

impl fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeStore")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Creates a store for the kinds in `registry`.
    pub fn new(client: Client, registry: Arc<TypeRegistry>) -> Self {
        Self { client, registry }
    }

    fn api(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, StoreError> {
        let resource = self
            .registry
            .resource(gvk)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        Ok(match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        })
    }
}

fn name_of(obj: &DynamicObject) -> Result<&str, StoreError> {
    obj.metadata
        .name
        .as_deref()
        .ok_or_else(|| StoreError::Invalid("metadata.name is required".to_string()))
}

/// Maps an API status code onto the store's error kinds.
fn from_status(code: u16, message: String) -> StoreError {
    match code {
        404 | 410 => StoreError::NotFound(message),
        // Stale resourceVersion and server-side apply field conflicts both
        // come back as 409.
        409 => StoreError::Conflict(message),
        400 | 422 => StoreError::Invalid(message),
        _ => StoreError::Transport(format!("{code}: {message}")),
    }
}

fn map_kube_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) => from_status(ae.code, ae.message),
        other => StoreError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        self.api(gvk, namespace)?
            .get_opt(name)
            .await
            .map_err(map_kube_error)
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        let list = self
            .api(gvk, namespace)?
            .list(&params)
            .await
            .map_err(map_kube_error)?;
        Ok(list.items)
    }

    async fn apply(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
        field_manager: &str,
        force: bool,
    ) -> Result<DynamicObject, StoreError> {
        let name = name_of(obj)?;
        let mut body = obj.clone();
        body.types.get_or_insert_with(|| type_meta(gvk));
        // The server rejects applied configurations that carry these.
        body.metadata.managed_fields = None;
        body.metadata.resource_version = None;

        let mut params = PatchParams::apply(field_manager);
        if force {
            params = params.force();
        }
        self.api(gvk, obj.metadata.namespace.as_deref())?
            .patch(name, &params, &Patch::Apply(&body))
            .await
            .map_err(map_kube_error)
    }

    async fn replace(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, StoreError> {
        let name = name_of(obj)?;
        let params = PostParams {
            field_manager: Some(field_manager.to_string()),
            ..PostParams::default()
        };
        let api = self.api(gvk, obj.metadata.namespace.as_deref())?;
        match api.replace(name, &params, obj).await.map_err(map_kube_error) {
            // Without a resourceVersion the caller saw no live object.
            Err(StoreError::NotFound(_)) if obj.metadata.resource_version.is_none() => {
                api.create(&params, obj).await.map_err(map_kube_error)
            }
            result => result,
        }
    }

    async fn update_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
        resource_version: Option<&str>,
    ) -> Result<DynamicObject, StoreError> {
        // A resourceVersion in a merge patch turns it into a compare-and-swap.
        let patch = match resource_version {
            Some(rv) => json!({"metadata": {"resourceVersion": rv}, "status": status}),
            None => json!({"status": status}),
        };
        self.api(gvk, namespace)?
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_kube_error)
    }

    fn watch(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> WatchStream {
        let api = match self.api(gvk, namespace) {
            Ok(api) => api,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let kind = gvk.kind.clone();
        watcher(api, watcher::Config::default())
            .filter_map(move |result| {
                let event = match result {
                    Ok(watcher::Event::InitApply(obj)) => {
                        Some(Ok(WatchEvent::new(WatchEventType::Added, obj)))
                    }
                    Ok(watcher::Event::Apply(obj)) => {
                        Some(Ok(WatchEvent::new(WatchEventType::Modified, obj)))
                    }
                    Ok(watcher::Event::Delete(obj)) => {
                        Some(Ok(WatchEvent::new(WatchEventType::Deleted, obj)))
                    }
                    Ok(watcher::Event::Init) => {
                        debug!(kind = %kind, "Watch (re)listing");
                        None
                    }
                    Ok(watcher::Event::InitDone) => {
                        debug!(kind = %kind, "Watch initialization complete");
                        None
                    }
                    Err(e) => Some(Err(StoreError::Transport(format!(
                        "Watcher stream error: {e}"
                    )))),
                };
                async move { event }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile_core::ErrorClass;
    use reconcile_core::ReconcileError;

    fn class(code: u16) -> ErrorClass {
        ReconcileError::from(from_status(code, "boom".to_string())).class()
    }

    #[test]
    fn test_status_codes() {
        assert!(matches!(
            from_status(404, "gone".to_string()),
            StoreError::NotFound(m) if m == "gone"
        ));
        assert!(matches!(
            from_status(409, "stale".to_string()),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            from_status(422, "bad".to_string()),
            StoreError::Invalid(_)
        ));
        assert!(matches!(
            from_status(503, "unavailable".to_string()),
            StoreError::Transport(m) if m == "503: unavailable"
        ));
    }

    #[test]
    fn test_status_code_classes() {
        assert_eq!(class(409), ErrorClass::Conflict);
        assert_eq!(class(400), ErrorClass::Invalid);
        assert_eq!(class(422), ErrorClass::Invalid);
        assert_eq!(class(500), ErrorClass::Transient);
        assert_eq!(class(429), ErrorClass::Transient);
    }
}
