//! Environment configuration.
//!
//! | Variable           | Default                  |
//! |--------------------|--------------------------|
//! | `WATCH_NAMESPACE`  | all namespaces           |
//! | `FIELD_MANAGER`    | `declaration-controller` |
//! | `WORKERS`          | 2                        |
//! | `BASE_BACKOFF_MS`  | 5                        |
//! | `MAX_BACKOFF_SECS` | 300                      |
//! | `FORCE_APPLY`      | true                     |
//! | `APPLY_MODE`       | `merge` (or `replace`)   |
//! | `RESYNC_SECS`      | unset (no resync)        |

use crate::error::ControllerError;
use crds::Declaration;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Resource;
use kube::core::GroupVersionKind;
use reconcile_core::{ApplyMode, ControllerConfig};
use reconcile_core::config::{DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_WORKERS};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Field manager name used when `FIELD_MANAGER` is unset.
pub const DEFAULT_FIELD_MANAGER: &str = "declaration-controller";

/// Kind this controller watches.
pub fn declaration_gvk() -> GroupVersionKind {
    gvk_of::<Declaration>()
}

/// Kind rendered for each Declaration.
pub fn deployment_gvk() -> GroupVersionKind {
    gvk_of::<Deployment>()
}

fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// Reads the engine configuration from the process environment.
pub fn from_env() -> Result<ControllerConfig, ControllerError> {
    load(|name| env::var(name).ok())
}

/// Builds the engine configuration from a variable lookup.
pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Result<ControllerConfig, ControllerError> {
    let field_manager =
        lookup("FIELD_MANAGER").unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_string());
    let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty());

    let workers = parse(&lookup, "WORKERS")?.unwrap_or(DEFAULT_WORKERS);
    let base_backoff = parse(&lookup, "BASE_BACKOFF_MS")?
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_BASE_BACKOFF);
    let max_backoff = parse(&lookup, "MAX_BACKOFF_SECS")?
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_MAX_BACKOFF);
    let force_apply = parse(&lookup, "FORCE_APPLY")?.unwrap_or(true);
    let apply_mode = parse::<ApplyMode>(&lookup, "APPLY_MODE")?.unwrap_or_default();
    let resync_period = parse(&lookup, "RESYNC_SECS")?.map(Duration::from_secs);

    let config = ControllerConfig::new(declaration_gvk(), vec![deployment_gvk()], field_manager)
        .with_workers(workers)
        .with_backoff(base_backoff, max_backoff)
        .with_force_apply(force_apply)
        .with_apply_mode(apply_mode)
        .with_namespace(namespace)
        .with_resync_period(resync_period);
    config.validate()?;
    Ok(config)
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ControllerError>
where
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim().parse().map_err(|e| {
                ControllerError::InvalidConfig(format!("{name}={raw:?}: {e}"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = load(lookup(&[])).unwrap();
        assert_eq!(config.watched_kind, declaration_gvk());
        assert_eq!(config.owned_kinds, vec![deployment_gvk()]);
        assert_eq!(config.field_manager, DEFAULT_FIELD_MANAGER);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.base_backoff, DEFAULT_BASE_BACKOFF);
        assert_eq!(config.max_backoff, DEFAULT_MAX_BACKOFF);
        assert!(config.force_apply);
        assert_eq!(config.apply_mode, ApplyMode::Merge);
        assert_eq!(config.namespace, None);
        assert_eq!(config.resync_period, None);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(declaration_gvk().group, "mygroup.example.com");
        assert_eq!(declaration_gvk().version, "v1alpha1");
        assert_eq!(deployment_gvk().group, "apps");
        assert_eq!(deployment_gvk().kind, "Deployment");
    }

    #[test]
    fn test_overrides() {
        let config = load(lookup(&[
            ("WATCH_NAMESPACE", "apps"),
            ("FIELD_MANAGER", "my-manager"),
            ("WORKERS", "8"),
            ("BASE_BACKOFF_MS", "10"),
            ("MAX_BACKOFF_SECS", "60"),
            ("FORCE_APPLY", "false"),
            ("APPLY_MODE", "Replace"),
            ("RESYNC_SECS", "600"),
        ]))
        .unwrap();
        assert_eq!(config.namespace.as_deref(), Some("apps"));
        assert_eq!(config.field_manager, "my-manager");
        assert_eq!(config.workers, 8);
        assert_eq!(config.base_backoff, Duration::from_millis(10));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
        assert!(!config.force_apply);
        assert_eq!(config.apply_mode, ApplyMode::Replace);
        assert_eq!(config.resync_period, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_blank_namespace_watches_all() {
        let config = load(lookup(&[("WATCH_NAMESPACE", " ")])).unwrap();
        assert_eq!(config.namespace, None);
    }

    #[test]
    fn test_rejects_unparseable_values() {
        let err = load(lookup(&[("WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
        assert!(err.to_string().contains("WORKERS"));

        let err = load(lookup(&[("FORCE_APPLY", "yes")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));

        let err = load(lookup(&[("APPLY_MODE", "patch")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
        assert!(err.to_string().contains("unknown apply mode 'patch'"));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let err = load(lookup(&[("WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, ControllerError::Config(_)));

        let err = load(lookup(&[("FIELD_MANAGER", "")])).unwrap_err();
        assert!(matches!(err, ControllerError::Config(_)));
    }
}
