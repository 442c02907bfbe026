//! Test utilities for unit testing the reconciler
//!
//! Builders for the Cluster API objects around a KubemarkMachine, plus
//! in-memory stand-ins for the management cluster, the workload cluster and
//! the connector handing out clients for the latter.

use crate::cluster::{ClusterConnector, CreateOutcome, ManagementCluster, WorkloadCluster};
use crate::error::ControllerError;
use async_trait::async_trait;
use crds::*;
use csr_bootstrap::{ClientIdentity, CsrClient, MockCsrClient};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Name of the Cluster every test machine belongs to
pub const TEST_CLUSTER: &str = "test-cluster";

/// Bootstrap token of the test KubeadmConfig
pub const TEST_BOOTSTRAP_TOKEN: &str = "abcdef.0123456789abcdef";

/// Admin kubeconfig of the test workload cluster
pub fn test_workload_kubeconfig() -> String {
    r#"apiVersion: v1
kind: Config
clusters:
- name: test-cluster
  cluster:
    server: https://workload.example:6443
    certificate-authority-data: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCk1JSUIKLS0tLS1FTkQgQ0VSVElGSUNBVEUtLS0tLQo=
users:
- name: test-cluster-admin
  user:
    token: admin-token
contexts:
- name: test-cluster-admin@test-cluster
  context:
    cluster: test-cluster
    user: test-cluster-admin
current-context: test-cluster-admin@test-cluster
"#
    .to_string()
}

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Helper to create a KubemarkMachine without owner or status
pub fn create_test_kubemark_machine(name: &str, namespace: &str) -> KubemarkMachine {
    KubemarkMachine {
        metadata: meta(name, namespace),
        spec: KubemarkMachineSpec::default(),
        status: None,
    }
}

/// Point the owner reference of `machine` at a Cluster API Machine
pub fn set_owner_machine(machine: &mut KubemarkMachine, owner: &str) {
    machine.metadata.owner_references = Some(vec![OwnerReference {
        api_version: format!("{}/v1beta1", CLUSTER_API_GROUP),
        kind: "Machine".to_string(),
        name: owner.to_string(),
        uid: format!("uid-{}", owner),
        ..Default::default()
    }]);
}

/// Helper to create a Machine whose bootstrap data is ready
pub fn create_test_machine(name: &str, namespace: &str, kubemark_machine: &str, config: &str) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            cluster_name: TEST_CLUSTER.to_string(),
            bootstrap: MachineBootstrap {
                config_ref: Some(ObjectReference {
                    api_version: Some("bootstrap.cluster.x-k8s.io/v1beta1".to_string()),
                    kind: Some("KubeadmConfig".to_string()),
                    name: config.to_string(),
                    namespace: None,
                }),
                data_secret_name: Some(format!("{}-bootstrap", name)),
            },
            infrastructure_ref: ObjectReference {
                api_version: Some("infrastructure.cluster.x-k8s.io/v1alpha4".to_string()),
                kind: Some("KubemarkMachine".to_string()),
                name: kubemark_machine.to_string(),
                namespace: None,
            },
            provider_id: None,
        },
    );
    machine.metadata.namespace = Some(namespace.to_string());
    machine.metadata.labels = Some(BTreeMap::from([(
        CLUSTER_NAME_LABEL.to_string(),
        TEST_CLUSTER.to_string(),
    )]));
    machine
}

/// Helper to create a Cluster
pub fn create_test_cluster(name: &str, namespace: &str, infrastructure_ready: bool) -> Cluster {
    let mut cluster = Cluster::new(name, ClusterSpec::default());
    cluster.metadata.namespace = Some(namespace.to_string());
    cluster.status = Some(ClusterStatus {
        infrastructure_ready,
    });
    cluster
}

/// Helper to create a KubeadmConfig carrying `token` in its join discovery
pub fn create_test_kubeadm_config(name: &str, namespace: &str, token: &str) -> KubeadmConfig {
    let mut config = KubeadmConfig::new(
        name,
        KubeadmConfigSpec {
            join_configuration: Some(JoinConfiguration {
                discovery: Discovery {
                    bootstrap_token: Some(BootstrapTokenDiscovery {
                        token: token.to_string(),
                    }),
                },
            }),
        },
    );
    config.metadata.namespace = Some(namespace.to_string());
    config
}

/// Self-signed client identity for the hollow node `name`
pub fn create_test_identity(name: &str) -> ClientIdentity {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(format!("system:node:{}", name)));
    dn.push(DnType::OrganizationName, DnValue::Utf8String("system:nodes".to_string()));
    params.distinguished_name = dn;
    let cert = params.self_signed(&key).unwrap();
    ClientIdentity::from_pem(&cert.pem(), &key.serialize_pem()).unwrap()
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct ManagementState {
    kubemark_machines: HashMap<Key, KubemarkMachine>,
    machines: HashMap<Key, Machine>,
    clusters: HashMap<Key, Cluster>,
    kubeadm_configs: HashMap<Key, KubeadmConfig>,
    secrets: HashMap<Key, BTreeMap<String, String>>,
    status_error: Option<String>,
}

/// In-memory management cluster
#[derive(Clone, Default)]
pub struct MockManagementCluster {
    state: Arc<Mutex<ManagementState>>,
}

impl MockManagementCluster {
    /// Empty management cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// A KubemarkMachine `name` owned by `<name>-machine`, with a ready
    /// Cluster, a KubeadmConfig `<name>-config` and the workload kubeconfig secret
    pub fn with_ready_cluster(namespace: &str, name: &str) -> Self {
        let cluster = Self::new();
        let machine_name = format!("{}-machine", name);
        let config_name = format!("{}-config", name);

        let mut kubemark_machine = create_test_kubemark_machine(name, namespace);
        set_owner_machine(&mut kubemark_machine, &machine_name);
        cluster.insert_kubemark_machine(kubemark_machine);
        cluster.insert_machine(create_test_machine(&machine_name, namespace, name, &config_name));
        cluster.insert_cluster(create_test_cluster(TEST_CLUSTER, namespace, true));
        cluster.insert_kubeadm_config(create_test_kubeadm_config(&config_name, namespace, TEST_BOOTSTRAP_TOKEN));
        cluster.insert_secret(
            namespace,
            &format!("{}{}", TEST_CLUSTER, KUBECONFIG_SECRET_SUFFIX),
            KUBECONFIG_SECRET_KEY,
            &test_workload_kubeconfig(),
        );
        cluster
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManagementState> {
        self.state.lock().unwrap()
    }

    /// Insert or replace a KubemarkMachine
    pub fn insert_kubemark_machine(&self, machine: KubemarkMachine) {
        let k = key(&machine.namespace().unwrap_or_default(), &machine.name_any());
        self.state().kubemark_machines.insert(k, machine);
    }

    /// Insert or replace a Machine
    pub fn insert_machine(&self, machine: Machine) {
        let k = key(&machine.namespace().unwrap_or_default(), &machine.name_any());
        self.state().machines.insert(k, machine);
    }

    /// Insert or replace a Cluster
    pub fn insert_cluster(&self, cluster: Cluster) {
        let k = key(&cluster.namespace().unwrap_or_default(), &cluster.name_any());
        self.state().clusters.insert(k, cluster);
    }

    /// Insert or replace a KubeadmConfig
    pub fn insert_kubeadm_config(&self, config: KubeadmConfig) {
        let k = key(&config.namespace().unwrap_or_default(), &config.name_any());
        self.state().kubeadm_configs.insert(k, config);
    }

    /// Set one data key of a Secret
    pub fn insert_secret(&self, namespace: &str, name: &str, data_key: &str, value: &str) {
        self.state()
            .secrets
            .entry(key(namespace, name))
            .or_default()
            .insert(data_key.to_string(), value.to_string());
    }

    /// Mutate a stored KubemarkMachine
    pub fn update_kubemark_machine(&self, namespace: &str, name: &str, f: impl FnOnce(&mut KubemarkMachine)) {
        if let Some(machine) = self.state().kubemark_machines.get_mut(&key(namespace, name)) {
            f(machine);
        }
    }

    /// Mutate a stored Machine
    pub fn update_machine(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Machine)) {
        if let Some(machine) = self.state().machines.get_mut(&key(namespace, name)) {
            f(machine);
        }
    }

    /// Fail provider ID and readiness updates with `reason`
    pub fn fail_status_updates(&self, reason: &str) {
        self.state().status_error = Some(reason.to_string());
    }

    /// `spec.providerID` of a stored Machine
    pub fn machine_provider_id(&self, namespace: &str, name: &str) -> Option<String> {
        self.state()
            .machines
            .get(&key(namespace, name))
            .and_then(|m| m.spec.provider_id.clone())
    }

    /// Copy of a stored KubemarkMachine
    pub fn kubemark_machine_snapshot(&self, namespace: &str, name: &str) -> Option<KubemarkMachine> {
        self.state().kubemark_machines.get(&key(namespace, name)).cloned()
    }

    /// Status of a stored KubemarkMachine
    pub fn kubemark_machine_status(&self, namespace: &str, name: &str) -> Option<KubemarkMachineStatus> {
        self.state()
            .kubemark_machines
            .get(&key(namespace, name))
            .and_then(|m| m.status.clone())
    }

    fn check_status_update(&self) -> Result<(), ControllerError> {
        match &self.state().status_error {
            Some(reason) => Err(ControllerError::StatusUpdateFailed(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ManagementCluster for MockManagementCluster {
    async fn kubemark_machine(&self, namespace: &str, name: &str) -> Result<Option<KubemarkMachine>, ControllerError> {
        Ok(self.state().kubemark_machines.get(&key(namespace, name)).cloned())
    }

    async fn machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, ControllerError> {
        Ok(self.state().machines.get(&key(namespace, name)).cloned())
    }

    async fn cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, ControllerError> {
        Ok(self.state().clusters.get(&key(namespace, name)).cloned())
    }

    async fn kubeadm_config(&self, namespace: &str, name: &str) -> Result<Option<KubeadmConfig>, ControllerError> {
        Ok(self.state().kubeadm_configs.get(&key(namespace, name)).cloned())
    }

    async fn secret_value(&self, namespace: &str, name: &str, data_key: &str) -> Result<Option<String>, ControllerError> {
        Ok(self
            .state()
            .secrets
            .get(&key(namespace, name))
            .and_then(|data| data.get(data_key).cloned()))
    }

    async fn set_machine_provider_id(&self, namespace: &str, name: &str, provider_id: &str) -> Result<(), ControllerError> {
        self.check_status_update()?;
        let mut state = self.state();
        let machine = state
            .machines
            .get_mut(&key(namespace, name))
            .ok_or_else(|| ControllerError::StatusUpdateFailed(format!("Machine {}/{} not found", namespace, name)))?;
        machine.spec.provider_id = Some(provider_id.to_string());
        Ok(())
    }

    async fn mark_ready(&self, namespace: &str, name: &str, provider_id: &str) -> Result<(), ControllerError> {
        self.check_status_update()?;
        let mut state = self.state();
        let machine = state.kubemark_machines.get_mut(&key(namespace, name)).ok_or_else(|| {
            ControllerError::StatusUpdateFailed(format!("KubemarkMachine {}/{} not found", namespace, name))
        })?;
        machine.status = Some(KubemarkMachineStatus {
            ready: true,
            provider_id: Some(provider_id.to_string()),
        });
        Ok(())
    }
}

#[derive(Default)]
struct WorkloadState {
    config_maps: HashMap<String, ConfigMap>,
    deployments: HashMap<String, Deployment>,
    config_map_creates: usize,
    deployment_creates: usize,
    deployment_error: Option<String>,
}

/// In-memory workload cluster; objects are keyed by name
#[derive(Clone, Default)]
pub struct MockWorkloadCluster {
    state: Arc<Mutex<WorkloadState>>,
}

impl MockWorkloadCluster {
    /// Stored ConfigMap
    pub fn config_map(&self, name: &str) -> Option<ConfigMap> {
        self.state.lock().unwrap().config_maps.get(name).cloned()
    }

    /// Stored Deployment
    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.state.lock().unwrap().deployments.get(name).cloned()
    }

    /// Number of ConfigMap create calls
    pub fn config_map_creates(&self) -> usize {
        self.state.lock().unwrap().config_map_creates
    }

    /// Number of Deployment create calls
    pub fn deployment_creates(&self) -> usize {
        self.state.lock().unwrap().deployment_creates
    }

    /// Fail Deployment creation with `reason`
    pub fn fail_deployments(&self, reason: &str) {
        self.state.lock().unwrap().deployment_error = Some(reason.to_string());
    }

    /// Stop failing
    pub fn clear_failures(&self) {
        self.state.lock().unwrap().deployment_error = None;
    }
}

fn insert_new<K: kube::Resource + Clone>(objects: &mut HashMap<String, K>, object: &K) -> CreateOutcome {
    let name = object.meta().name.clone().unwrap_or_default();
    if objects.contains_key(&name) {
        return CreateOutcome::AlreadyExists;
    }
    objects.insert(name, object.clone());
    CreateOutcome::Created
}

#[async_trait]
impl WorkloadCluster for MockWorkloadCluster {
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<CreateOutcome, ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.config_map_creates += 1;
        Ok(insert_new(&mut state.config_maps, config_map))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<CreateOutcome, ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.deployment_creates += 1;
        if let Some(reason) = &state.deployment_error {
            return Err(ControllerError::SubmissionFailed(reason.clone()));
        }
        Ok(insert_new(&mut state.deployments, deployment))
    }
}

/// Connector handing out a shared workload mock and a CSR mock
#[derive(Clone)]
pub struct MockClusterConnector {
    workload: MockWorkloadCluster,
    csr: MockCsrClient,
    bootstrap_kubeconfigs: Arc<Mutex<Vec<String>>>,
    timeouts: Arc<Mutex<Vec<Duration>>>,
}

impl MockClusterConnector {
    /// Connector whose CSR clients are clones of `csr`
    pub fn new(csr: MockCsrClient) -> Self {
        Self {
            workload: MockWorkloadCluster::default(),
            csr,
            bootstrap_kubeconfigs: Arc::new(Mutex::new(Vec::new())),
            timeouts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The workload cluster every `workload` call returns
    pub fn workload_cluster(&self) -> MockWorkloadCluster {
        self.workload.clone()
    }

    /// Kubeconfig passed to the most recent `csr_client` call
    pub fn last_bootstrap_kubeconfig(&self) -> Option<String> {
        self.bootstrap_kubeconfigs.lock().unwrap().last().cloned()
    }

    /// Client timeouts requested so far, in call order
    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterConnector for MockClusterConnector {
    async fn workload(&self, _kubeconfig: &str, timeout: Duration) -> Result<Box<dyn WorkloadCluster>, ControllerError> {
        self.timeouts.lock().unwrap().push(timeout);
        Ok(Box::new(self.workload.clone()))
    }

    async fn csr_client(&self, bootstrap_kubeconfig: &str, timeout: Duration) -> Result<Box<dyn CsrClient>, ControllerError> {
        self.timeouts.lock().unwrap().push(timeout);
        self.bootstrap_kubeconfigs
            .lock()
            .unwrap()
            .push(bootstrap_kubeconfig.to_string());
        Ok(Box::new(self.csr.clone()))
    }
}
