//! Shared fixtures for the engine tests.

#![allow(dead_code, reason = "shared by several test binaries")]

use crds::{Declaration, DeclarationSpec};
use k8s_openapi::api::apps::v1::Deployment;
use kube::core::{DynamicObject, GroupVersionKind};
use reconcile_core::{
    ControllerConfig, DesiredStateRenderer, Document, MockObjectStore, MockRecorder,
    ReconcileError, ReconcileKey, Reconciler, TypeRegistry,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

pub const NAMESPACE: &str = "default";
pub const FIELD_MANAGER: &str = "declaration-controller";

pub fn declaration_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("mygroup.example.com", "v1alpha1", "Declaration")
}

pub fn deployment_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apps", "v1", "Deployment")
}

pub fn registry() -> Arc<TypeRegistry> {
    Arc::new(
        TypeRegistry::builder()
            .register::<Declaration>()
            .register::<Deployment>()
            .build(),
    )
}

pub fn config() -> ControllerConfig {
    ControllerConfig::new(declaration_gvk(), vec![deployment_gvk()], FIELD_MANAGER)
        .with_backoff(Duration::from_millis(5), Duration::from_millis(50))
}

pub fn key(name: &str) -> ReconcileKey {
    ReconcileKey::new(NAMESPACE, name)
}

/// Renders one Deployment per Declaration, `<name>-deployment`.
#[derive(Debug, Default)]
pub struct TestRenderer;

impl DesiredStateRenderer for TestRenderer {
    fn render(&self, declaration: &DynamicObject) -> Result<Vec<DynamicObject>, ReconcileError> {
        let spec = Document::from_value_or_empty(
            declaration.data.get("spec").cloned().unwrap_or(Value::Null),
        )?;
        let image = spec.require_str("image")?;
        if image.is_empty() {
            return Err(ReconcileError::Render("spec.image must not be empty".to_string()));
        }
        let replicas = spec.get_i64("replicas")?.unwrap_or(1);
        let name = declaration.metadata.name.as_deref().unwrap_or_default();

        let deployment = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": format!("{name}-deployment")},
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": {"app": name}},
                "template": {
                    "metadata": {"labels": {"app": name}},
                    "spec": {"containers": [{"name": "main", "image": image}]}
                }
            }
        }))?;
        Ok(vec![deployment])
    }

    fn is_ready(&self, owned: &DynamicObject) -> Result<bool, ReconcileError> {
        let doc = Document::from_value_or_empty(owned.data.clone())?;
        let desired = doc.get_i64("spec.replicas")?.unwrap_or(1);
        let ready = doc.get_i64("status.readyReplicas")?.unwrap_or(0);
        Ok(ready >= desired)
    }
}

/// Store, recorder and reconciler wired together.
pub struct Harness {
    pub registry: Arc<TypeRegistry>,
    pub store: MockObjectStore,
    pub recorder: MockRecorder,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&config())
    }

    pub fn with_config(config: &ControllerConfig) -> Self {
        let registry = registry();
        let store = MockObjectStore::new(Arc::clone(&registry));
        let recorder = MockRecorder::new();
        let reconciler = Reconciler::new(
            config,
            Arc::new(store.clone()),
            Arc::new(TestRenderer),
            Arc::new(recorder.clone()),
        );
        Self {
            registry,
            store,
            recorder,
            reconciler,
        }
    }

    /// Stores a Declaration as a user would create it.
    pub fn create_declaration(&self, name: &str, spec: DeclarationSpec) -> DynamicObject {
        let mut decl = Declaration::new(name, spec);
        decl.metadata.namespace = Some(NAMESPACE.to_string());
        let obj = self.registry.encode(&decl).unwrap();
        self.store.insert(obj).unwrap()
    }

    pub fn declaration(&self, name: &str) -> DynamicObject {
        self.store
            .object(&declaration_gvk(), Some(NAMESPACE), name)
            .unwrap()
    }

    pub fn state(&self, name: &str) -> Option<String> {
        self.declaration(name).data["status"]["state"]
            .as_str()
            .map(str::to_string)
    }

    pub fn deployment(&self, name: &str) -> Option<DynamicObject> {
        self.store.object(&deployment_gvk(), Some(NAMESPACE), name)
    }

    /// Reports readiness on a Deployment the way its own controller would.
    pub fn set_ready_replicas(&self, name: &str, ready: i64) {
        self.store
            .set_status(
                &deployment_gvk(),
                Some(NAMESPACE),
                name,
                json!({"readyReplicas": ready}),
            )
            .unwrap();
    }
}

pub fn nginx_spec() -> DeclarationSpec {
    DeclarationSpec {
        image: "nginx:1.25".to_string(),
        memory_request: Some("64Mi".to_string()),
        replicas: None,
    }
}
