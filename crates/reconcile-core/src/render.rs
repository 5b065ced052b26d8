//! Desired-state rendering.

use crate::error::ReconcileError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;

/// Maps a Declaration to the objects it should own.
///
/// Implementations are pure: the same Declaration always renders the same
/// objects. The reconciler stamps namespace, owner reference and owner label
/// onto every rendered object afterwards, so renderers do not need to.
pub trait DesiredStateRenderer: Send + Sync {
    /// Full desired representation of each owned object.
    fn render(&self, declaration: &DynamicObject) -> Result<Vec<DynamicObject>, ReconcileError>;

    /// Readiness predicate for an observed owned object.
    fn is_ready(&self, owned: &DynamicObject) -> Result<bool, ReconcileError>;
}

/// Points `obj` at its controlling owner and labels it for listing.
pub fn stamp_owner(
    obj: &mut DynamicObject,
    owner: &OwnerReference,
    label_key: &str,
    namespace: Option<&str>,
) {
    obj.metadata.namespace = namespace.map(str::to_string);
    obj.metadata.owner_references = Some(vec![owner.clone()]);
    obj.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(label_key.to_string(), owner.name.clone());
}

/// Deterministic name of an owned object, `<declaration>-<suffix>`.
#[must_use]
pub fn child_name(declaration: &str, suffix: &str) -> String {
    format!("{declaration}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};

    #[test]
    fn test_stamp_owner() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
        let mut obj = DynamicObject::new(&child_name("nginx", "deployment"), &ar);
        let owner = OwnerReference {
            api_version: "mygroup.example.com/v1alpha1".to_string(),
            kind: "Declaration".to_string(),
            name: "nginx".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        stamp_owner(&mut obj, &owner, "mygroup.example.com/declaration", Some("default"));

        assert_eq!(obj.metadata.name.as_deref(), Some("nginx-deployment"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(obj.metadata.owner_references, Some(vec![owner]));
        assert_eq!(
            obj.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get("mygroup.example.com/declaration"))
                .map(String::as_str),
            Some("nginx")
        );
    }
}
