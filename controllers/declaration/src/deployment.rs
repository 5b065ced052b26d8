//! Deployment rendering for Declarations.
//!
//! Each Declaration owns exactly one Deployment named `<name>-deployment`,
//! running a single container called `main`.

use crate::config::declaration_gvk;
use crds::Declaration;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::core::DynamicObject;
use reconcile_core::object::owner_label_key;
use reconcile_core::render::child_name;
use reconcile_core::{DesiredStateRenderer, Document, ReconcileError, TypeRegistry};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the only container in the rendered pod template.
pub const CONTAINER_NAME: &str = "main";

/// Suffix appended to the Declaration name.
const NAME_SUFFIX: &str = "deployment";

/// Renders a Declaration into its Deployment.
#[derive(Debug, Clone)]
pub struct DeploymentRenderer {
    registry: Arc<TypeRegistry>,
}

impl DeploymentRenderer {
    /// Creates a renderer. `registry` must know both Declaration and Deployment.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    fn deployment(&self, decl: &Declaration) -> Result<Deployment, ReconcileError> {
        let name = decl
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ReconcileError::Render("Declaration has no name".to_string()))?;
        let spec = &decl.spec;
        if spec.image.trim().is_empty() {
            return Err(ReconcileError::Render("spec.image must not be empty".to_string()));
        }
        let replicas = spec.replicas.unwrap_or(1);
        if replicas < 0 {
            return Err(ReconcileError::Render(format!(
                "spec.replicas must not be negative, got {replicas}"
            )));
        }

        let labels = BTreeMap::from([(owner_label_key(&declaration_gvk()), name.to_string())]);
        let resources = spec.memory_request.as_ref().map(|memory| ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity(memory.clone()),
            )])),
            ..ResourceRequirements::default()
        });

        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(child_name(name, NAME_SUFFIX)),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..LabelSelector::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: CONTAINER_NAME.to_string(),
                            image: Some(spec.image.clone()),
                            resources,
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            status: None,
        })
    }
}

impl DesiredStateRenderer for DeploymentRenderer {
    fn render(&self, declaration: &DynamicObject) -> Result<Vec<DynamicObject>, ReconcileError> {
        let decl: Declaration = self.registry.decode(declaration)?;
        let deployment = self.deployment(&decl)?;
        Ok(vec![self.registry.encode(&deployment)?])
    }

    /// Ready once the Deployment reports as many ready replicas as it asks for.
    fn is_ready(&self, owned: &DynamicObject) -> Result<bool, ReconcileError> {
        let doc = Document::from_value_or_empty(owned.data.clone())?;
        let desired = doc.get_i64("spec.replicas")?.unwrap_or(1);
        let ready = doc.get_i64("status.readyReplicas")?.unwrap_or(0);
        Ok(ready >= desired)
    }
}
