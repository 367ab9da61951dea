//! Special Resource Controller
//!
//! Provisions hardware enablement stacks (kernel modules, driver containers,
//! device plugins) from charts onto the nodes selected by `SpecialResource`
//! CRDs, replicating kernel-affine steps once per kernel version running in
//! the cluster.
//!
//! `SpecialResourceModule` CRDs additionally follow string fields of
//! external objects and are reconciled whenever one of them changes.

mod assets;
mod backoff;
mod cluster;
mod config;
mod controller;
mod error;
mod events;
mod filter;
mod kernel;
mod lifecycle;
mod metrics;
mod path_watcher;
mod queue;
mod reconciler;
mod render;
mod states;
#[cfg(test)]
mod states_test;
mod status;
mod storage;
#[cfg(test)]
mod test_utils;
mod watcher;

use config::ControllerConfig;
use controller::Controller;
use error::ControllerError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    install_crypto_provider()?;

    info!("Starting Special Resource Controller");

    let config = ControllerConfig::load()?;

    info!("Configuration:");
    info!("  Operator namespace: {}", config.operator_namespace);
    info!(
        "  Watch namespace: {}",
        config.watch_namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Metrics address: {}", config.metrics_addr);
    info!("  Lifecycle ConfigMap: {}", config.lifecycle_configmap);
    info!("  Charts directory: {}", config.charts_dir);
    info!(
        "  Driver toolkit image: {}",
        config.driver_toolkit_image.as_deref().unwrap_or("<none>")
    );
    info!("  Max backoff: {}s", config.max_backoff_seconds);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}

/// kube's rustls client needs a process-wide crypto provider
fn install_crypto_provider() -> Result<(), ControllerError> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|existing| {
            ControllerError::InvalidConfig(format!(
                "rustls crypto provider already installed: {:?}",
                existing
            ))
        })
}
