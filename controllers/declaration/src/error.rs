//! Controller-specific error types.
//!
//! Errors raised while starting the Declaration controller. Failures inside a
//! reconcile run are `reconcile_core::ReconcileError` and never surface here;
//! the engine retries them.

use kube::Error as KubeError;
use reconcile_core::{ConfigError, RegistryError};
use thiserror::Error;

/// Errors that can occur in the Declaration controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Engine configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kind missing from the type registry
    #[error("Type registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Signal handling failed
    #[error("Signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}
