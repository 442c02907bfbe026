//! Access to the management cluster and to workload clusters.
//!
//! The reconciler only talks to these traits so it can be exercised against
//! in-memory fakes; the `Kube*` types implement them with kube clients.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{Cluster, KubeadmConfig, KubemarkMachine, Machine};
use csr_bootstrap::{CsrClient, KubeCsrClient};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Result of an idempotent create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The object was created
    Created,
    /// An object with that name already existed
    AlreadyExists,
}

/// Reads and status updates against the management cluster
#[async_trait]
pub trait ManagementCluster: Send + Sync {
    /// Fetch a KubemarkMachine
    async fn kubemark_machine(&self, namespace: &str, name: &str) -> Result<Option<KubemarkMachine>, ControllerError>;

    /// Fetch a Cluster API Machine
    async fn machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, ControllerError>;

    /// Fetch a Cluster API Cluster
    async fn cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, ControllerError>;

    /// Fetch a KubeadmConfig
    async fn kubeadm_config(&self, namespace: &str, name: &str) -> Result<Option<KubeadmConfig>, ControllerError>;

    /// Read one data key of a Secret as UTF-8
    async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>, ControllerError>;

    /// Set `spec.providerID` of a Machine
    async fn set_machine_provider_id(&self, namespace: &str, name: &str, provider_id: &str) -> Result<(), ControllerError>;

    /// Mark a KubemarkMachine ready with its provider ID
    async fn mark_ready(&self, namespace: &str, name: &str, provider_id: &str) -> Result<(), ControllerError>;
}

/// Object creation in a workload cluster
#[async_trait]
pub trait WorkloadCluster: Send + Sync {
    /// Create a ConfigMap; an existing one with the same name is not an error
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<CreateOutcome, ControllerError>;

    /// Create a Deployment; an existing one with the same name is not an error
    async fn create_deployment(&self, deployment: &Deployment) -> Result<CreateOutcome, ControllerError>;
}

/// Builds clients for workload clusters
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Client for the workload cluster described by its admin kubeconfig
    async fn workload(&self, kubeconfig: &str, timeout: Duration) -> Result<Box<dyn WorkloadCluster>, ControllerError>;

    /// CSR client authenticated by a bootstrap-token kubeconfig
    async fn csr_client(&self, bootstrap_kubeconfig: &str, timeout: Duration) -> Result<Box<dyn CsrClient>, ControllerError>;
}

/// `ManagementCluster` backed by the controller's own kube client
#[derive(Clone)]
pub struct KubeManagementCluster {
    client: Client,
}

impl KubeManagementCluster {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, ControllerError>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    api.get_opt(name).await.map_err(ControllerError::Kube)
}

#[async_trait]
impl ManagementCluster for KubeManagementCluster {
    async fn kubemark_machine(&self, namespace: &str, name: &str) -> Result<Option<KubemarkMachine>, ControllerError> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, ControllerError> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, ControllerError> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn kubeadm_config(&self, namespace: &str, name: &str) -> Result<Option<KubeadmConfig>, ControllerError> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>, ControllerError> {
        let secret: Option<Secret> = get_opt(Api::namespaced(self.client.clone(), namespace), name).await?;
        let Some(bytes) = secret.and_then(|s| s.data).and_then(|mut data| data.remove(key)) else {
            return Ok(None);
        };
        String::from_utf8(bytes.0).map(Some).map_err(|e| {
            ControllerError::InvalidConfig(format!("secret {}/{} key {} is not UTF-8: {}", namespace, name, key, e))
        })
    }

    async fn set_machine_provider_id(&self, namespace: &str, name: &str, provider_id: &str) -> Result<(), ControllerError> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "providerID": provider_id } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn mark_ready(&self, namespace: &str, name: &str, provider_id: &str) -> Result<(), ControllerError> {
        let api: Api<KubemarkMachine> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": { "ready": true, "providerID": provider_id } });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

/// `WorkloadCluster` backed by a kube client for the workload cluster
#[derive(Clone)]
pub struct KubeWorkloadCluster {
    client: Client,
}

async fn create_idempotent<K>(api: Api<K>, object: &K) -> Result<CreateOutcome, ControllerError>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(CreateOutcome::Created),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!("{} already exists", object.meta().name.as_deref().unwrap_or("<unknown>"));
            Ok(CreateOutcome::AlreadyExists)
        }
        Err(e) => Err(ControllerError::Kube(e)),
    }
}

fn namespace_of<K: kube::Resource>(object: &K) -> Result<&str, ControllerError> {
    object
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidConfig("object to create has no namespace".to_string()))
}

#[async_trait]
impl WorkloadCluster for KubeWorkloadCluster {
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<CreateOutcome, ControllerError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace_of(config_map)?);
        create_idempotent(api, config_map).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<CreateOutcome, ControllerError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace_of(deployment)?);
        create_idempotent(api, deployment).await
    }
}

/// `ClusterConnector` building kube clients from kubeconfig documents
#[derive(Debug, Clone, Default)]
pub struct KubeClusterConnector;

impl KubeClusterConnector {
    async fn client(kubeconfig: &str, timeout: Duration) -> Result<Client, ControllerError> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
            .map_err(|e| ControllerError::InvalidConfig(format!("invalid kubeconfig: {}", e)))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ControllerError::InvalidConfig(format!("unusable kubeconfig: {}", e)))?;
        config.connect_timeout = Some(timeout);
        config.read_timeout = Some(timeout);
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl ClusterConnector for KubeClusterConnector {
    async fn workload(&self, kubeconfig: &str, timeout: Duration) -> Result<Box<dyn WorkloadCluster>, ControllerError> {
        let client = Self::client(kubeconfig, timeout).await?;
        Ok(Box::new(KubeWorkloadCluster { client }))
    }

    async fn csr_client(&self, bootstrap_kubeconfig: &str, timeout: Duration) -> Result<Box<dyn CsrClient>, ControllerError> {
        let client = Self::client(bootstrap_kubeconfig, timeout).await?;
        Ok(Box::new(KubeCsrClient::new(client)))
    }
}
