//! Object identity, owner references and label selectors.

use crate::error::ReconcileError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of any stored object: (group, version, kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// Group/version/kind of the object
    pub gvk: GroupVersionKind,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ResourceKey {
    /// Builds a key from its parts.
    pub fn new(gvk: GroupVersionKind, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Key of a stored object, if it carries a name.
    #[must_use]
    pub fn of(gvk: &GroupVersionKind, obj: &DynamicObject) -> Option<Self> {
        Some(Self {
            gvk: gvk.clone(),
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone()?,
        })
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk.kind, ns, self.name),
            None => write!(f, "{} {}", self.gvk.kind, self.name),
        }
    }
}

/// The unit of scheduling: namespace and name of a Declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    /// Declaration namespace
    pub namespace: String,
    /// Declaration name
    pub name: String,
}

impl ReconcileKey {
    /// Builds a key from namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a Declaration object. Objects without a namespace land in "default".
    #[must_use]
    pub fn from_object(obj: &DynamicObject) -> Option<Self> {
        let name = obj.metadata.name.clone()?;
        let namespace = obj
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        Some(Self { namespace, name })
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `apiVersion` string for a gvk ("v1" for the core group).
#[must_use]
pub fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Splits an `apiVersion` string and kind into a gvk.
#[must_use]
pub fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.rsplit_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

/// Group/version/kind carried by an object's type metadata.
#[must_use]
pub fn gvk_of(obj: &DynamicObject) -> Option<GroupVersionKind> {
    obj.types
        .as_ref()
        .map(|types| parse_gvk(&types.api_version, &types.kind))
}

/// Type metadata for a gvk.
#[must_use]
pub fn type_meta(gvk: &GroupVersionKind) -> TypeMeta {
    TypeMeta {
        api_version: api_version_of(gvk),
        kind: gvk.kind.clone(),
    }
}

/// Label key under which owned objects record their Declaration's name.
///
/// For `mygroup.example.com/v1alpha1 Declaration` this is
/// `mygroup.example.com/declaration`.
#[must_use]
pub fn owner_label_key(owner: &GroupVersionKind) -> String {
    let kind = owner.kind.to_lowercase();
    if owner.group.is_empty() {
        kind
    } else {
        format!("{}/{}", owner.group, kind)
    }
}

/// The owner reference flagged `controller: true`, if any.
#[must_use]
pub fn controller_owner(obj: &DynamicObject) -> Option<&OwnerReference> {
    obj.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.controller == Some(true))
}

/// True when `obj` is controlled by the object with `uid`.
#[must_use]
pub fn is_controlled_by(obj: &DynamicObject, uid: &str) -> bool {
    controller_owner(obj).is_some_and(|owner| owner.uid == uid)
}

/// Controller owner reference pointing at `owner`.
///
/// The owner must have been read from the store; a name and uid are required.
pub fn controller_reference(
    owner: &DynamicObject,
    gvk: &GroupVersionKind,
) -> Result<OwnerReference, ReconcileError> {
    let name = owner
        .metadata
        .name
        .clone()
        .ok_or_else(|| ReconcileError::Render("owner has no name".to_string()))?;
    let uid = owner
        .metadata
        .uid
        .clone()
        .ok_or_else(|| ReconcileError::Render(format!("owner {name} has no uid")))?;
    Ok(OwnerReference {
        api_version: api_version_of(gvk),
        kind: gvk.kind.clone(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector matching every object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `key=value` requirement.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// True when the selector has no requirements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    /// Required labels.
    #[must_use]
    pub fn match_labels(&self) -> &BTreeMap<String, String> {
        &self.match_labels
    }

    /// True when every requirement is met by `labels`.
    #[must_use]
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.match_labels.iter().all(|(key, value)| {
            labels
                .and_then(|labels| labels.get(key))
                .is_some_and(|actual| actual == value)
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.match_labels {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}
