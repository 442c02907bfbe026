//! KubemarkMachine Controller
//!
//! Cluster API infrastructure provider for kubemark: every KubemarkMachine
//! becomes a hollow kubelet running as a Deployment inside its workload
//! cluster, authenticated with a node client certificate obtained through the
//! bootstrap-token CSR flow.

mod backoff;
mod cluster;
mod config;
mod controller;
mod error;
mod flags;
mod kubeconfig;
mod metrics;
mod reconciler;
mod watcher;
mod workload;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Failed to install rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting KubemarkMachine Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Kubemark image: {}", config.kubemark_image);
    info!(
        "  Bootstrap: poll every {:?}, give up after {:?}, yield after {:?}",
        config.bootstrap.poll_interval, config.bootstrap.timeout, config.bootstrap.poll_window
    );
    info!("  Metrics address: {}", config.metrics_addr);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let controller = Controller::new(config, shutdown).await?;
    if let Err(e) = controller.run().await {
        error!("Controller stopped with error: {}", e);
        return Err(e);
    }

    info!("KubemarkMachine Controller stopped");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
