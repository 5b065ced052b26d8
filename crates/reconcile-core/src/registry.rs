//! Type registry
//!
//! Explicit mapping from group/version/kind to the API resource description
//! and a typed validator. Built once at startup and shared by `Arc`; it is
//! never mutated afterwards.

use crate::error::RegistryError;
use crate::object::{api_version_of, gvk_of};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

type Validator = fn(&Value) -> Result<(), serde_json::Error>;

fn validate_as<K: DeserializeOwned>(value: &Value) -> Result<(), serde_json::Error> {
    K::deserialize(value).map(|_| ())
}

#[derive(Debug, Clone)]
struct Registration {
    resource: ApiResource,
    validate: Option<Validator>,
}

/// Immutable gvk → resource/codec map.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<GroupVersionKind, Registration>,
}

/// Builder for [`TypeRegistry`].
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    types: HashMap<GroupVersionKind, Registration>,
}

fn gvk_of_resource(resource: &ApiResource) -> GroupVersionKind {
    GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind)
}

impl TypeRegistryBuilder {
    /// Registers a statically typed kind.
    #[must_use]
    pub fn register<K>(mut self) -> Self
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = ApiResource::erase::<K>(&());
        self.types.insert(
            gvk_of_resource(&resource),
            Registration {
                resource,
                validate: Some(validate_as::<K>),
            },
        );
        self
    }

    /// Registers a kind known only at runtime. Objects of this kind are not
    /// validated.
    #[must_use]
    pub fn register_dynamic(mut self, resource: ApiResource) -> Self {
        self.types.insert(
            gvk_of_resource(&resource),
            Registration {
                resource,
                validate: None,
            },
        );
        self
    }

    /// Freezes the registry.
    #[must_use]
    pub fn build(self) -> TypeRegistry {
        TypeRegistry { types: self.types }
    }
}

impl TypeRegistry {
    /// Starts an empty registry.
    #[must_use]
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// API resource description for `gvk`.
    pub fn resource(&self, gvk: &GroupVersionKind) -> Result<&ApiResource, RegistryError> {
        self.types
            .get(gvk)
            .map(|registration| &registration.resource)
            .ok_or_else(|| RegistryError::UnknownKind(describe(gvk)))
    }

    /// True when `gvk` was registered.
    #[must_use]
    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.types.contains_key(gvk)
    }

    /// Registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = &GroupVersionKind> {
        self.types.keys()
    }

    /// Checks that `obj` is of a registered kind and decodes as its type.
    pub fn validate(&self, obj: &DynamicObject) -> Result<GroupVersionKind, RegistryError> {
        let gvk = gvk_of(obj).ok_or(RegistryError::MissingTypeMeta)?;
        let registration = self
            .types
            .get(&gvk)
            .ok_or_else(|| RegistryError::UnknownKind(describe(&gvk)))?;
        if let Some(validate) = registration.validate {
            let value = serde_json::to_value(obj).map_err(|source| RegistryError::Codec {
                kind: gvk.kind.clone(),
                source,
            })?;
            validate(&value).map_err(|source| RegistryError::Codec {
                kind: gvk.kind.clone(),
                source,
            })?;
        }
        Ok(gvk)
    }

    /// Decodes a dynamic object into its registered type.
    pub fn decode<K>(&self, obj: &DynamicObject) -> Result<K, RegistryError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let expected = K::kind(&());
        let gvk = gvk_of(obj).ok_or(RegistryError::MissingTypeMeta)?;
        if gvk.kind != expected || api_version_of(&gvk) != K::api_version(&()) {
            return Err(RegistryError::KindMismatch {
                expected: format!("{} {}", K::api_version(&()), expected),
                found: format!("{} {}", api_version_of(&gvk), gvk.kind),
            });
        }
        if !self.contains(&gvk) {
            return Err(RegistryError::UnknownKind(describe(&gvk)));
        }
        serde_json::to_value(obj)
            .and_then(serde_json::from_value)
            .map_err(|source| RegistryError::Codec {
                kind: expected.to_string(),
                source,
            })
    }

    /// Encodes a typed object as a dynamic one.
    pub fn encode<K>(&self, obj: &K) -> Result<DynamicObject, RegistryError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let kind = K::kind(&()).to_string();
        let resource = ApiResource::erase::<K>(&());
        let gvk = gvk_of_resource(&resource);
        if !self.contains(&gvk) {
            return Err(RegistryError::UnknownKind(describe(&gvk)));
        }
        let mut value = serde_json::to_value(obj).map_err(|source| RegistryError::Codec {
            kind: kind.clone(),
            source,
        })?;
        // k8s-openapi types carry their type meta; make sure custom ones do too.
        if let Value::Object(map) = &mut value {
            map.insert("apiVersion".to_string(), Value::String(resource.api_version));
            map.insert("kind".to_string(), Value::String(resource.kind));
        }
        serde_json::from_value(value).map_err(|source| RegistryError::Codec { kind, source })
    }
}

fn describe(gvk: &GroupVersionKind) -> String {
    format!("{} {}", api_version_of(gvk), gvk.kind)
}
