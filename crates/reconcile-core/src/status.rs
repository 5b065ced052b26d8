//! Status aggregation
//!
//! Pure mapping from the observed owned objects to the Declaration status.
//! Nothing outside the inputs is read, so the result only depends on ground
//! truth and is safe to recompute after a restart.

use crate::error::ReconcileError;
use crate::object::ReconcileKey;
use crds::{DeclarationState, DeclarationStatus};
use kube::core::{DynamicObject, GroupVersionKind};

/// Owned objects of one managed kind found for a Declaration.
#[derive(Debug, Clone)]
pub struct ObservedKind {
    /// Managed kind
    pub gvk: GroupVersionKind,
    /// Objects controlled by the Declaration
    pub objects: Vec<DynamicObject>,
}

/// Computes the Declaration status.
///
/// Per managed kind: more than one object is ambiguous ownership and fails
/// the run; none means Building. Ready requires exactly one object of every
/// kind, each satisfying `is_ready`.
pub fn aggregate_status<F>(
    declaration: &DynamicObject,
    observed: &[ObservedKind],
    is_ready: F,
) -> Result<DeclarationStatus, ReconcileError>
where
    F: Fn(&DynamicObject) -> Result<bool, ReconcileError>,
{
    let generation = declaration.metadata.generation;

    if let Some(kind) = observed.iter().find(|kind| kind.objects.len() > 1) {
        return Err(ReconcileError::AmbiguousOwnership {
            declaration: ReconcileKey::from_object(declaration)
                .map_or_else(|| "<unnamed>".to_string(), |key| key.to_string()),
            kind: kind.gvk.kind.clone(),
            count: kind.objects.len(),
        });
    }

    let mut ready = !observed.is_empty();
    for kind in observed {
        match kind.objects.first() {
            None => ready = false,
            Some(obj) => ready = ready && is_ready(obj)?,
        }
    }

    let state = if ready {
        DeclarationState::Ready
    } else {
        DeclarationState::Building
    };
    Ok(DeclarationStatus::new(state, generation))
}

/// Status currently stored on a Declaration, if any.
#[must_use]
pub fn current_status(declaration: &DynamicObject) -> Option<DeclarationStatus> {
    declaration
        .data
        .get("status")
        .filter(|status| !status.is_null())
        .and_then(|status| serde_json::from_value(status.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ApiResource;
    use serde_json::json;

    fn deployment_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "Deployment")
    }

    fn declaration() -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "mygroup.example.com",
            "v1alpha1",
            "Declaration",
        ));
        let mut decl = DynamicObject::new("nginx", &ar).within("default");
        decl.metadata.generation = Some(4);
        decl
    }

    fn deployment(name: &str, ready_replicas: i64) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ApiResource::from_gvk(&deployment_gvk()));
        obj.data = json!({"status": {"readyReplicas": ready_replicas}});
        obj
    }

    fn ready(obj: &DynamicObject) -> Result<bool, ReconcileError> {
        Ok(obj.data["status"]["readyReplicas"] == json!(1))
    }

    fn observed(objects: Vec<DynamicObject>) -> Vec<ObservedKind> {
        vec![ObservedKind {
            gvk: deployment_gvk(),
            objects,
        }]
    }

    #[test]
    fn test_no_objects_is_building() {
        let status = aggregate_status(&declaration(), &observed(vec![]), ready).unwrap();
        assert_eq!(status.state, DeclarationState::Building);
        assert_eq!(status.observed_generation, Some(4));
    }

    #[test]
    fn test_single_unready_is_building() {
        let status =
            aggregate_status(&declaration(), &observed(vec![deployment("a", 0)]), ready).unwrap();
        assert_eq!(status.state, DeclarationState::Building);
    }

    #[test]
    fn test_single_ready_is_ready() {
        let status =
            aggregate_status(&declaration(), &observed(vec![deployment("a", 1)]), ready).unwrap();
        assert_eq!(status.state, DeclarationState::Ready);
    }

    #[test]
    fn test_multiple_is_ambiguous() {
        let err = aggregate_status(
            &declaration(),
            &observed(vec![deployment("a", 1), deployment("b", 1)]),
            ready,
        )
        .unwrap_err();
        match err {
            ReconcileError::AmbiguousOwnership {
                declaration,
                kind,
                count,
            } => {
                assert_eq!(declaration, "default/nginx");
                assert_eq!(kind, "Deployment");
                assert_eq!(count, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_every_kind_must_be_ready() {
        let mut kinds = observed(vec![deployment("a", 1)]);
        kinds.push(ObservedKind {
            gvk: GroupVersionKind::gvk("", "v1", "Service"),
            objects: vec![],
        });
        let status = aggregate_status(&declaration(), &kinds, ready).unwrap();
        assert_eq!(status.state, DeclarationState::Building);
    }

    #[test]
    fn test_current_status() {
        let mut decl = declaration();
        assert_eq!(current_status(&decl), None);
        decl.data = json!({"status": {"state": "Ready", "observedGeneration": 4}});
        assert_eq!(
            current_status(&decl),
            Some(DeclarationStatus::new(DeclarationState::Ready, Some(4)))
        );
    }
}
