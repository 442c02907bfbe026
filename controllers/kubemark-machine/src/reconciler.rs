//! Reconciliation logic for KubemarkMachine CRDs.
//!
//! One pass resolves the owning Machine, its Cluster and bootstrap token,
//! obtains a client certificate for the hollow node through the CSR API,
//! creates the identity bundle and the kubemark Deployment in the workload
//! cluster and finally reports the machine ready. Every step is safe to
//! repeat: creates treat "already exists" as success and status writes are
//! idempotent merge patches.

use crate::cluster::{ClusterConnector, CreateOutcome, ManagementCluster};
use crate::error::ControllerError;
use crate::kubeconfig::{self, ClusterAccess};
use crate::metrics::Metrics;
use crate::workload::{IDENTITY_CERT_PATH, WorkloadAssembler, kubemark_args};
use crds::{
    CLUSTER_API_GROUP, KUBECONFIG_SECRET_KEY, KUBECONFIG_SECRET_SUFFIX, KubemarkMachine, Machine,
    provider_id_for,
};
use csr_bootstrap::{
    BootstrapConfig, BootstrapOutcome, CertificateBootstrapper, CsrClient, CsrError, IdentityRequest,
    SigningRequest,
};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a reconcile pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Bundle and workload exist, status written
    Provisioned,
    /// Status was already ready; nothing to do
    AlreadyReady,
    /// The KubemarkMachine no longer exists
    Absent,
    /// A dependency is not ready yet; expect redelivery
    Deferred(String),
    /// The CSR has not been signed yet; retry after the given delay
    BootstrapPending {
        /// Delay before the next pass
        retry_after: Duration,
    },
}

impl ReconcileOutcome {
    /// Label used for the `outcome` dimension of reconcile metrics
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Provisioned => "provisioned",
            ReconcileOutcome::AlreadyReady => "already_ready",
            ReconcileOutcome::Absent => "absent",
            ReconcileOutcome::Deferred(_) => "deferred",
            ReconcileOutcome::BootstrapPending { .. } => "bootstrap_pending",
        }
    }
}

/// Everything resolved from the management cluster that a pass needs
struct Dependencies {
    machine: KubemarkMachine,
    owner: Machine,
    bootstrap_token: String,
    workload_kubeconfig: String,
    workload_access: ClusterAccess,
}

enum Resolution {
    Ready(Box<Dependencies>),
    Done(ReconcileOutcome),
}

fn defer(reason: impl Into<String>) -> Result<Resolution, ControllerError> {
    let reason = reason.into();
    warn!("{}", reason);
    Ok(Resolution::Done(ReconcileOutcome::Deferred(reason)))
}

/// Reconciles KubemarkMachine resources.
pub struct Reconciler {
    management: Arc<dyn ManagementCluster>,
    connector: Arc<dyn ClusterConnector>,
    bootstrapper: CertificateBootstrapper,
    assembler: WorkloadAssembler,
    remote_timeout: Duration,
    metrics: Metrics,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        management: Arc<dyn ManagementCluster>,
        connector: Arc<dyn ClusterConnector>,
        bootstrap: BootstrapConfig,
        assembler: WorkloadAssembler,
        remote_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            management,
            connector,
            bootstrapper: CertificateBootstrapper::new(bootstrap),
            assembler,
            remote_timeout,
            metrics,
        }
    }

    /// Metrics recorded by this reconciler
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Drop the bootstrap session of a deleted KubemarkMachine
    pub fn forget(&self, namespace: &str, name: &str) {
        self.bootstrapper.release(&IdentityRequest::for_node(namespace, name).key);
    }

    #[cfg(test)]
    pub(crate) fn bootstrap_sessions(&self) -> usize {
        self.bootstrapper.session_count()
    }

    /// Reconciles one KubemarkMachine.
    ///
    /// This method:
    /// 1. Fetches the KubemarkMachine (absent → no-op, already ready → no-op)
    /// 2. Resolves the owning Machine through its owner reference
    /// 3. Resolves the Cluster, the KubeadmConfig bootstrap token and the workload kubeconfig
    /// 4. Builds a bootstrap-token kubeconfig for the workload cluster
    /// 5. Obtains a client certificate through the CSR API
    /// 6. Builds the hollow node's kubeconfig
    /// 7. Assembles the identity bundle and the Deployment
    /// 8. Creates both in `kube-system` of the workload cluster
    /// 9. Sets the Machine's provider ID and marks the KubemarkMachine ready
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ControllerError> {
        info!("Reconciling KubemarkMachine {}/{}", namespace, name);
        let request = IdentityRequest::for_node(namespace, name);

        let deps = match self.resolve(namespace, name, &request).await? {
            Resolution::Ready(deps) => deps,
            Resolution::Done(outcome) => return Ok(outcome),
        };

        // Reject flags that cannot be encoded before asking for a certificate
        kubemark_args(&deps.machine)?;

        // Workload API server and CA, bootstrap token as the only credential
        let bootstrap_kubeconfig = kubeconfig::token_kubeconfig(&deps.workload_access, &deps.bootstrap_token)?;
        let csr_client = self
            .connector
            .csr_client(&bootstrap_kubeconfig, self.remote_timeout)
            .await?;
        let csr_client = CountingCsrClient {
            inner: csr_client.as_ref(),
            metrics: &self.metrics,
        };

        let started = Instant::now();
        let bootstrap = self.bootstrapper.bootstrap(&request, &csr_client, cancel).await;
        let identity = match bootstrap {
            Ok(BootstrapOutcome::Issued(identity)) => {
                self.metrics.observe_bootstrap("issued", started.elapsed());
                identity
            }
            Ok(BootstrapOutcome::Pending { retry_after }) => {
                self.metrics.observe_bootstrap("pending", started.elapsed());
                info!("Certificate for {} not issued yet, retrying in {:?}", request.key, retry_after);
                return Ok(ReconcileOutcome::BootstrapPending { retry_after });
            }
            Err(e) => {
                self.metrics.observe_bootstrap("failed", started.elapsed());
                return Err(e.into());
            }
        };

        let node_kubeconfig = kubeconfig::certificate_kubeconfig(&deps.workload_access, IDENTITY_CERT_PATH)?;
        let bundle = self.assembler.identity_bundle(name, node_kubeconfig, &identity);
        let deployment = self.assembler.workload_descriptor(&deps.machine, &bundle)?;

        let workload = self
            .connector
            .workload(&deps.workload_kubeconfig, self.remote_timeout)
            .await?;
        let created = workload.create_config_map(&bundle.to_config_map()).await.map_err(|e| {
            ControllerError::SubmissionFailed(format!("identity bundle {}: {}", name, e))
        })?;
        log_create("ConfigMap", name, created);
        let created = workload.create_deployment(&deployment).await.map_err(|e| {
            ControllerError::SubmissionFailed(format!("Deployment {}: {}", name, e))
        })?;
        log_create("Deployment", name, created);

        let provider_id = provider_id_for(name);
        let owner_namespace = deps.owner.namespace().unwrap_or_else(|| namespace.to_string());
        let owner_name = deps.owner.name_any();
        self.management
            .set_machine_provider_id(&owner_namespace, &owner_name, &provider_id)
            .await
            .map_err(|e| {
                ControllerError::StatusUpdateFailed(format!("Machine {}/{}: {}", owner_namespace, owner_name, e))
            })?;
        self.management
            .mark_ready(namespace, name, &provider_id)
            .await
            .map_err(|e| ControllerError::StatusUpdateFailed(format!("KubemarkMachine {}/{}: {}", namespace, name, e)))?;

        // The identity now lives in the bundle
        self.bootstrapper.release(&request.key);
        info!("KubemarkMachine {}/{} is ready as {}", namespace, name, provider_id);
        Ok(ReconcileOutcome::Provisioned)
    }

    /// Steps 1-3: everything read from the management cluster
    async fn resolve(
        &self,
        namespace: &str,
        name: &str,
        request: &IdentityRequest,
    ) -> Result<Resolution, ControllerError> {
        let Some(machine) = self.management.kubemark_machine(namespace, name).await? else {
            debug!("KubemarkMachine {}/{} no longer exists", namespace, name);
            self.bootstrapper.release(&request.key);
            return Ok(Resolution::Done(ReconcileOutcome::Absent));
        };
        if machine.is_ready() {
            debug!("KubemarkMachine {}/{} is already ready", namespace, name);
            return Ok(Resolution::Done(ReconcileOutcome::AlreadyReady));
        }

        let Some(owner_name) = owner_machine_name(&machine) else {
            return defer(format!(
                "Machine controller has not set the owner reference on {}/{} yet",
                namespace, name
            ));
        };
        let Some(owner) = self.management.machine(namespace, &owner_name).await? else {
            return defer(format!("owner Machine {}/{} not found", namespace, owner_name));
        };

        let Some(cluster_name) = owner.cluster_name().map(str::to_string) else {
            return defer(format!("Machine {}/{} has no cluster name", namespace, owner_name));
        };
        let Some(cluster) = self.management.cluster(namespace, &cluster_name).await? else {
            return defer(format!("Cluster {}/{} not found", namespace, cluster_name));
        };
        if !cluster.infrastructure_ready() {
            return defer(format!("Cluster {}/{} infrastructure is not ready yet", namespace, cluster_name));
        }

        if owner.spec.bootstrap.data_secret_name.is_none() {
            return defer(format!(
                "bootstrap data secret of Machine {}/{} is not available yet",
                namespace, owner_name
            ));
        }
        let Some(config_ref) = owner.spec.bootstrap.config_ref.as_ref() else {
            return defer(format!("Machine {}/{} has no bootstrap config reference", namespace, owner_name));
        };
        let config_namespace = config_ref.namespace.as_deref().unwrap_or(namespace);
        let Some(kubeadm_config) = self.management.kubeadm_config(config_namespace, &config_ref.name).await? else {
            return defer(format!("KubeadmConfig {}/{} not found", config_namespace, config_ref.name));
        };
        let token = kubeadm_config.bootstrap_token().ok_or_else(|| {
            ControllerError::InvalidConfig(format!(
                "KubeadmConfig {}/{} has no bootstrap token in its join configuration",
                config_namespace, config_ref.name
            ))
        })?;

        let secret_name = format!("{}{}", cluster_name, KUBECONFIG_SECRET_SUFFIX);
        let Some(workload_kubeconfig) = self
            .management
            .secret_value(namespace, &secret_name, KUBECONFIG_SECRET_KEY)
            .await?
        else {
            return defer(format!("workload kubeconfig secret {}/{} not found", namespace, secret_name));
        };
        let workload_access = ClusterAccess::from_kubeconfig(&workload_kubeconfig)?;

        Ok(Resolution::Ready(Box::new(Dependencies {
            bootstrap_token: token.token.clone(),
            machine,
            owner,
            workload_kubeconfig,
            workload_access,
        })))
    }
}

/// Name of the Cluster API Machine owning `machine`
fn owner_machine_name(machine: &KubemarkMachine) -> Option<String> {
    machine
        .owner_references()
        .iter()
        .find(|r| {
            r.kind == "Machine"
                && r.api_version
                    .split('/')
                    .next()
                    .is_some_and(|group| group == CLUSTER_API_GROUP)
        })
        .map(|r| r.name.clone())
}

fn log_create(kind: &str, name: &str, outcome: CreateOutcome) {
    match outcome {
        CreateOutcome::Created => info!("Created {} kube-system/{}", kind, name),
        CreateOutcome::AlreadyExists => debug!("{} kube-system/{} already exists", kind, name),
    }
}

/// Counts successful CSR submissions
struct CountingCsrClient<'a> {
    inner: &'a dyn CsrClient,
    metrics: &'a Metrics,
}

#[async_trait::async_trait]
impl CsrClient for CountingCsrClient<'_> {
    async fn submit(&self, request: &SigningRequest) -> Result<String, CsrError> {
        let name = self.inner.submit(request).await?;
        self.metrics.csr_submitted();
        Ok(name)
    }

    async fn issued_certificate(&self, csr_name: &str) -> Result<Option<String>, CsrError> {
        self.inner.issued_certificate(csr_name).await
    }
}
