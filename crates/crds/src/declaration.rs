//! Declaration CRD
//!
//! A user-authored desired-state resource. The controller renders one
//! workload per Declaration and reports the aggregate state back here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "mygroup.example.com",
    version = "v1alpha1",
    kind = "Declaration",
    namespaced,
    status = "DeclarationStatus",
    shortname = "decl"
)]
#[serde(rename_all = "camelCase")]
pub struct DeclarationSpec {
    /// Container image to run (e.g. "nginx:1.25")
    pub image: String,

    /// Memory request for the main container (e.g. "64Mi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,

    /// Desired replica count (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// Observed state of a Declaration. Written only by the controller.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeclarationStatus {
    /// Aggregate state of the owned resources
    pub state: DeclarationState,

    /// `metadata.generation` of the Declaration this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl DeclarationStatus {
    /// Status reporting `state` for the given generation.
    #[must_use]
    pub fn new(state: DeclarationState, observed_generation: Option<i64>) -> Self {
        Self {
            state,
            observed_generation,
        }
    }
}

/// Aggregate state of a Declaration
///
/// Serializes as PascalCase ("Building", "Ready") but also accepts the
/// lowercase spelling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum DeclarationState {
    /// No owned resource is ready yet
    #[default]
    #[serde(alias = "building")]
    Building,

    /// Exactly one owned resource exists and reports ready
    #[serde(alias = "ready")]
    Ready,
}

impl std::fmt::Display for DeclarationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Building => f.write_str("Building"),
            Self::Ready => f.write_str("Ready"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::{CustomResourceExt, Resource};

    #[test]
    fn test_status_serializes_pascal_case() {
        let status = DeclarationStatus::new(DeclarationState::Ready, Some(3));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"state": "Ready", "observedGeneration": 3}));
    }

    #[test]
    fn test_status_accepts_lowercase_state() {
        let status: DeclarationStatus =
            serde_json::from_value(serde_json::json!({"state": "building"})).unwrap();
        assert_eq!(status.state, DeclarationState::Building);
        assert_eq!(status.observed_generation, None);
    }

    #[test]
    fn test_spec_uses_camel_case() {
        let spec = DeclarationSpec {
            image: "nginx:1.25".to_string(),
            memory_request: Some("64Mi".to_string()),
            replicas: None,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json, serde_json::json!({"image": "nginx:1.25", "memoryRequest": "64Mi"}));
    }

    #[test]
    fn test_crd_identity() {
        assert_eq!(Declaration::kind(&()), "Declaration");
        assert_eq!(Declaration::api_version(&()), "mygroup.example.com/v1alpha1");
        let crd = Declaration::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("declarations.mygroup.example.com"));
    }
}
