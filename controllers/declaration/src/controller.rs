//! Main controller implementation.
//!
//! Wires the kube-backed store, event recorder and Deployment renderer into
//! the reconcile engine and runs it until the process is asked to stop.

use crate::deployment::DeploymentRenderer;
use crate::error::ControllerError;
use crate::events::KubeEventRecorder;
use crate::kube_store::KubeStore;
use crds::Declaration;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Client;
use reconcile_core::{ControllerConfig, TypeRegistry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Declaration controller bound to a cluster.
#[derive(Debug)]
pub struct Controller {
    engine: reconcile_core::Controller,
}

/// Kinds the controller reads and writes.
pub fn registry() -> TypeRegistry {
    TypeRegistry::builder()
        .register::<Declaration>()
        .register::<Deployment>()
        .build()
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Declaration Controller");

        let registry = Arc::new(registry());
        registry.resource(&config.watched_kind)?;
        for kind in &config.owned_kinds {
            registry.resource(kind)?;
        }

        let client = Client::try_default().await?;
        let store = KubeStore::new(client.clone(), Arc::clone(&registry));
        let recorder = KubeEventRecorder::new(client, &config.field_manager);
        let renderer = DeploymentRenderer::new(registry);

        let engine = reconcile_core::Controller::new(
            config,
            Arc::new(store),
            Arc::new(renderer),
            Arc::new(recorder),
        )?;
        Ok(Self { engine })
    }

    /// Runs the controller until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<(), ControllerError> {
        let cancel = CancellationToken::new();
        let engine = tokio::spawn(self.engine.run(cancel.clone()));

        shutdown_signal().await?;
        info!("Shutdown signal received");
        cancel.cancel();

        if let Err(e) = engine.await {
            warn!("Controller task ended abnormally: {}", e);
        }
        info!("Declaration Controller stopped");
        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<(), ControllerError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<(), ControllerError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{declaration_gvk, deployment_gvk};

    #[test]
    fn test_registry_covers_configured_kinds() {
        let registry = registry();
        assert!(registry.contains(&declaration_gvk()));
        assert!(registry.contains(&deployment_gvk()));
        assert_eq!(registry.kinds().count(), 2);
    }
}
