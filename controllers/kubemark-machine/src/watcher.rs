//! Kubernetes resource watchers.
//!
//! KubemarkMachines are reconciled through `kube_runtime::Controller`, which
//! handles reconnection, deduplication and per-object serialization. Machine
//! changes are mapped back to the KubemarkMachine named in their
//! infrastructure reference so a Machine gaining its bootstrap data wakes the
//! deferred KubemarkMachine without waiting for a requeue.
//!
//! Deleted KubemarkMachines never reach `reconcile`; the controller reports
//! them as `ObjectNotFound`, which drops their bootstrap session.

use crate::backoff::BackoffTracker;
use crate::error::ControllerError;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crds::{KubemarkMachine, Machine};
use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{
    Controller, watcher,
    controller::{self, Action, Config as ControllerConfig},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state handed to every reconcile call
pub struct Context {
    reconciler: Arc<Reconciler>,
    backoff: BackoffTracker,
    defer_requeue: Duration,
    cancel: CancellationToken,
}

impl Context {
    /// Creates the reconcile context.
    pub fn new(reconciler: Arc<Reconciler>, defer_requeue: Duration, cancel: CancellationToken) -> Self {
        Self {
            reconciler,
            backoff: BackoffTracker::new(),
            defer_requeue,
            cancel,
        }
    }
}

fn object_key(machine: &KubemarkMachine) -> String {
    format!("{}/{}", machine.namespace().unwrap_or_default(), machine.name_any())
}

/// Requeue policy for a finished pass
pub fn action_for(outcome: &ReconcileOutcome, defer_requeue: Duration) -> Action {
    match outcome {
        ReconcileOutcome::Provisioned | ReconcileOutcome::AlreadyReady | ReconcileOutcome::Absent => {
            Action::await_change()
        }
        ReconcileOutcome::Deferred(_) => Action::requeue(defer_requeue),
        ReconcileOutcome::BootstrapPending { retry_after } => Action::requeue(*retry_after),
    }
}

/// KubemarkMachine a Machine points at through its infrastructure reference
pub fn infrastructure_machine(machine: &Machine) -> Option<ObjectRef<KubemarkMachine>> {
    let infra = &machine.spec.infrastructure_ref;
    if infra.kind.as_deref() != Some("KubemarkMachine") || infra.name.is_empty() {
        return None;
    }
    let namespace = infra.namespace.clone().or_else(|| machine.namespace())?;
    Some(ObjectRef::new(&infra.name).within(&namespace))
}

async fn reconcile(machine: Arc<KubemarkMachine>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();
    debug!("Reconciling KubemarkMachine {}/{}", namespace, name);

    let metrics = ctx.reconciler.metrics();
    match ctx.reconciler.reconcile(&namespace, &name, &ctx.cancel).await {
        Ok(outcome) => {
            metrics.reconcile_finished(outcome.label());
            ctx.backoff.reset(&object_key(&machine));
            Ok(action_for(&outcome, ctx.defer_requeue))
        }
        Err(e) => {
            metrics.reconcile_failed(&e);
            Err(e)
        }
    }
}

fn error_policy(machine: Arc<KubemarkMachine>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let key = object_key(&machine);
    let delay = ctx.backoff.next_delay(&key);
    error!("Reconciliation failed for KubemarkMachine {}: {} (retrying in {:?})", key, error, delay);
    Action::requeue(delay)
}

/// Handles one item of the controller's output stream
fn handle_result<QueueErr>(
    ctx: &Context,
    result: Result<(ObjectRef<KubemarkMachine>, Action), controller::Error<ControllerError, QueueErr>>,
) where
    QueueErr: std::error::Error + 'static,
{
    match result {
        Ok((object, action)) => debug!("Reconciled {} ({:?})", object.name, action),
        Err(controller::Error::ObjectNotFound(object)) => {
            let namespace = object.namespace.unwrap_or_default();
            info!(
                "KubemarkMachine {}/{} was deleted, dropping its bootstrap session",
                namespace, object.name
            );
            ctx.reconciler.forget(&namespace, &object.name);
            ctx.backoff.reset(&format!("{}/{}", namespace, object.name));
        }
        Err(e) => warn!("KubemarkMachine controller error: {}", e),
    }
}

/// Watches KubemarkMachines and the Machines owning them.
pub struct Watcher {
    context: Arc<Context>,
    kubemark_machine_api: Api<KubemarkMachine>,
    machine_api: Api<Machine>,
    concurrency: u16,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        context: Arc<Context>,
        kubemark_machine_api: Api<KubemarkMachine>,
        machine_api: Api<Machine>,
        concurrency: u16,
    ) -> Self {
        Self {
            context,
            kubemark_machine_api,
            machine_api,
            concurrency,
        }
    }

    /// Runs the KubemarkMachine controller until a shutdown signal arrives.
    pub async fn watch_kubemark_machines(&self) -> Result<(), ControllerError> {
        info!("Starting KubemarkMachine watcher (concurrency {})", self.concurrency);

        let controller_config = ControllerConfig::default()
            .debounce(Duration::from_secs(1))
            .concurrency(self.concurrency);

        let context = self.context.clone();
        Controller::new(self.kubemark_machine_api.clone(), watcher::Config::default())
            .watches(self.machine_api.clone(), watcher::Config::default(), |machine| {
                infrastructure_machine(&machine)
            })
            .with_config(controller_config)
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.context.clone())
            .for_each(|res| {
                handle_result(&context, res);
                std::future::ready(())
            })
            .await;

        info!("KubemarkMachine watcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::test_utils::{MockClusterConnector, MockManagementCluster, create_test_machine};
    use crate::workload::WorkloadAssembler;
    use csr_bootstrap::{BootstrapConfig, MockCsrClient};

    fn context(management: &MockManagementCluster) -> Arc<Context> {
        context_with(management, MockCsrClient::new(), Duration::from_secs(5))
    }

    fn context_with(management: &MockManagementCluster, csr: MockCsrClient, poll_window: Duration) -> Arc<Context> {
        let reconciler = Reconciler::new(
            Arc::new(management.clone()),
            Arc::new(MockClusterConnector::new(csr)),
            BootstrapConfig {
                poll_interval: Duration::from_millis(5),
                timeout: Duration::from_secs(5),
                poll_window,
                session_ttl: Duration::from_secs(60),
            },
            WorkloadAssembler::new("kubemark:test"),
            Duration::from_secs(30),
            Metrics::new().unwrap(),
        );
        Arc::new(Context::new(Arc::new(reconciler), Duration::from_secs(30), CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_reconcile_records_outcome() {
        let management = MockManagementCluster::with_ready_cluster("default", "km-1");
        let ctx = context(&management);
        let machine = management.kubemark_machine_snapshot("default", "km-1").unwrap();

        let action = reconcile(Arc::new(machine), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(ctx.reconciler.metrics().reconcile_count("provisioned"), 1.0);
    }

    #[tokio::test]
    async fn test_error_policy_backs_off_until_success() {
        let management = MockManagementCluster::with_ready_cluster("default", "km-1");
        let ctx = context(&management);
        let machine = Arc::new(management.kubemark_machine_snapshot("default", "km-1").unwrap());
        let error = ControllerError::SubmissionFailed("boom".to_string());

        assert_eq!(error_policy(machine.clone(), &error, ctx.clone()), Action::requeue(Duration::from_secs(60)));
        assert_eq!(error_policy(machine.clone(), &error, ctx.clone()), Action::requeue(Duration::from_secs(60)));
        assert_eq!(error_policy(machine.clone(), &error, ctx.clone()), Action::requeue(Duration::from_secs(120)));

        reconcile(machine.clone(), ctx.clone()).await.unwrap();
        assert_eq!(error_policy(machine, &error, ctx), Action::requeue(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_deleted_machine_drops_pending_bootstrap() {
        let management = MockManagementCluster::with_ready_cluster("default", "km-1");
        let ctx = context_with(&management, MockCsrClient::new().never_issue(), Duration::from_millis(20));
        let machine = management.kubemark_machine_snapshot("default", "km-1").unwrap();

        let action = reconcile(Arc::new(machine), ctx.clone()).await.unwrap();
        assert_ne!(action, Action::await_change());
        assert_eq!(ctx.reconciler.bootstrap_sessions(), 1);

        // Deleted mid-bootstrap: the controller reports the object as not found
        let deleted = ObjectRef::<KubemarkMachine>::new("km-1").within("default").erase();
        handle_result::<watcher::Error>(&ctx, Err(controller::Error::ObjectNotFound(deleted)));

        assert_eq!(ctx.reconciler.bootstrap_sessions(), 0);
    }

    #[tokio::test]
    async fn test_other_controller_errors_keep_sessions() {
        let management = MockManagementCluster::with_ready_cluster("default", "km-1");
        let ctx = context_with(&management, MockCsrClient::new().never_issue(), Duration::from_millis(20));
        let machine = management.kubemark_machine_snapshot("default", "km-1").unwrap();
        reconcile(Arc::new(machine), ctx.clone()).await.unwrap();

        let failed = ObjectRef::<KubemarkMachine>::new("km-1").within("default").erase();
        handle_result::<watcher::Error>(
            &ctx,
            Err(controller::Error::ReconcilerFailed(
                ControllerError::SubmissionFailed("boom".to_string()),
                failed,
            )),
        );

        assert_eq!(ctx.reconciler.bootstrap_sessions(), 1);
    }

    #[test]
    fn test_action_for_outcomes() {
        let defer = Duration::from_secs(30);

        assert_eq!(action_for(&ReconcileOutcome::Provisioned, defer), Action::await_change());
        assert_eq!(action_for(&ReconcileOutcome::AlreadyReady, defer), Action::await_change());
        assert_eq!(action_for(&ReconcileOutcome::Absent, defer), Action::await_change());
        assert_eq!(
            action_for(&ReconcileOutcome::Deferred("cluster not ready".to_string()), defer),
            Action::requeue(defer)
        );
        assert_eq!(
            action_for(
                &ReconcileOutcome::BootstrapPending {
                    retry_after: Duration::from_secs(1)
                },
                defer
            ),
            Action::requeue(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_machine_maps_to_its_kubemark_machine() {
        let machine = create_test_machine("km-1-machine", "default", "km-1", "km-1-config");

        let object = infrastructure_machine(&machine).unwrap();
        assert_eq!(object.name, "km-1");
        assert_eq!(object.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn test_machine_with_other_infrastructure_is_ignored() {
        let mut machine = create_test_machine("m-1", "default", "km-1", "cfg");
        machine.spec.infrastructure_ref.kind = Some("DockerMachine".to_string());

        assert!(infrastructure_machine(&machine).is_none());
    }
}
