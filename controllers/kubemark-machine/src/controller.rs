//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the reconciler,
//! the KubemarkMachine watcher and the metrics server together.

use crate::cluster::{KubeClusterConnector, KubeManagementCluster};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::{self, Metrics};
use crate::reconciler::Reconciler;
use crate::watcher::{Context, Watcher};
use crate::workload::WorkloadAssembler;
use crds::{KubemarkMachine, Machine};
use kube::{Api, Client};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Main controller for KubemarkMachine provisioning.
pub struct Controller {
    kubemark_machine_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(config: ControllerConfig, shutdown: CancellationToken) -> Result<Self, ControllerError> {
        info!("Initializing KubemarkMachine Controller");

        let kube_client = Client::try_default().await?;
        let metrics = Metrics::new()?;
        let ready = Arc::new(AtomicBool::new(false));

        let metrics_server = tokio::spawn(metrics::serve(
            config.metrics_addr,
            metrics.clone(),
            ready.clone(),
            shutdown.clone(),
        ));

        let (kubemark_machine_api, machine_api): (Api<KubemarkMachine>, Api<Machine>) = match &config.namespace {
            Some(ns) => (
                Api::namespaced(kube_client.clone(), ns),
                Api::namespaced(kube_client.clone(), ns),
            ),
            None => (Api::all(kube_client.clone()), Api::all(kube_client.clone())),
        };

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(KubeManagementCluster::new(kube_client)),
            Arc::new(KubeClusterConnector),
            config.bootstrap,
            WorkloadAssembler::new(config.kubemark_image.clone()),
            config.remote_client_timeout,
            metrics,
        ));
        let context = Arc::new(Context::new(reconciler, config.defer_requeue, shutdown.clone()));
        let watcher = Watcher::new(context, kubemark_machine_api, machine_api, config.reconcile_concurrency);

        let kubemark_machine_watcher = tokio::spawn(async move { watcher.watch_kubemark_machines().await });
        ready.store(true, Ordering::SeqCst);

        Ok(Self {
            kubemark_machine_watcher,
            metrics_server,
            shutdown,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("KubemarkMachine Controller running");

        let result = tokio::select! {
            result = &mut self.kubemark_machine_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("KubemarkMachine watcher panicked: {}", e)))
                    .and_then(|r| r)
            }
            result = &mut self.metrics_server => {
                result.map_err(|e| ControllerError::Watch(format!("metrics server panicked: {}", e)))
                    .and_then(|r| r)
                    .and_then(|_| Err(ControllerError::Watch("metrics server exited".to_string())))
            }
        };

        // Stop in-flight bootstraps and the metrics server
        self.shutdown.cancel();
        if !self.metrics_server.is_finished() {
            if let Err(e) = (&mut self.metrics_server).await {
                warn!("Metrics server task failed during shutdown: {}", e);
            }
        }

        result
    }
}
