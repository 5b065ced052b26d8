//! Declaration Controller
//!
//! Watches `Declaration` resources and keeps one Deployment per Declaration
//! in line with its spec:
//! - renders `<name>-deployment` from the image, memory request and replicas
//! - server-side applies it under a dedicated field manager
//! - reports `Building` until the Deployment's replicas are ready, then `Ready`
//!
//! Changes to owned Deployments are routed back to their Declaration, so
//! readiness and drift are picked up without polling.

mod config;
mod controller;
mod deployment;
mod error;
mod events;
mod kube_store;


use anyhow::Context;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting Declaration Controller");

    let config = config::from_env().context("Failed to load configuration")?;

    info!("Configuration:");
    info!("  Field manager: {}", config.field_manager);
    info!("  Workers: {}", config.workers);
    info!("  Apply mode: {}", config.apply_mode);
    info!(
        "  Backoff: {:?} .. {:?}",
        config.base_backoff, config.max_backoff
    );
    info!(
        "  Namespace: {}",
        config.namespace.as_deref().unwrap_or("all namespaces")
    );

    // Initialize and run controller
    let controller = Controller::new(config)
        .await
        .context("Failed to start controller")?;
    controller.run().await?;

    Ok(())
}
