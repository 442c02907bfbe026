//! Cluster API types consumed by the kubemark provider
//!
//! Only the fields the machine controller reads are modelled here; everything
//! else in the upstream objects is ignored on deserialization. These kinds are
//! owned by Cluster API and are never emitted by `crdgen`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the Cluster API core types
pub const CLUSTER_API_GROUP: &str = "cluster.x-k8s.io";

/// Label carrying the owning cluster's name on Cluster API objects
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Suffix of the secret holding the admin kubeconfig of a workload cluster
pub const KUBECONFIG_SECRET_SUFFIX: &str = "-kubeconfig";

/// Data key of the kubeconfig inside the `<cluster>-kubeconfig` secret
pub const KUBECONFIG_SECRET_KEY: &str = "value";

/// Reference to another object, as used in Cluster API specs
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// API version of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name of the referent
    #[serde(default)]
    pub name: String,

    /// Namespace of the referent (defaults to the referencing object's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the cluster this machine belongs to
    #[serde(default)]
    pub cluster_name: String,

    /// Bootstrap configuration for the machine
    #[serde(default)]
    pub bootstrap: MachineBootstrap,

    /// Reference to the infrastructure machine (e.g. a KubemarkMachine)
    #[serde(default)]
    pub infrastructure_ref: ObjectReference,

    /// Provider ID of the node backing this machine
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineBootstrap {
    /// Reference to the bootstrap provider config (a KubeadmConfig)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,

    /// Name of the secret holding bootstrap data, set once bootstrap data is generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Whether the infrastructure provider reports the cluster infrastructure ready
    #[serde(default)]
    pub infrastructure_ready: bool,
}

impl Cluster {
    /// Whether the cluster infrastructure is ready for machines to join
    pub fn infrastructure_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.infrastructure_ready)
            .unwrap_or(false)
    }
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "bootstrap.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "KubeadmConfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmConfigSpec {
    /// kubeadm join configuration used by worker machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_configuration: Option<JoinConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfiguration {
    /// How the joining node discovers the cluster
    #[serde(default)]
    pub discovery: Discovery,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    /// Token based discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_token: Option<BootstrapTokenDiscovery>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapTokenDiscovery {
    /// Bootstrap token (`<id>.<secret>`)
    #[serde(default)]
    pub token: String,
}

impl KubeadmConfig {
    /// Bootstrap token discovery section of the join configuration, if any
    pub fn bootstrap_token(&self) -> Option<&BootstrapTokenDiscovery> {
        self.spec
            .join_configuration
            .as_ref()
            .and_then(|j| j.discovery.bootstrap_token.as_ref())
            .filter(|t| !t.token.is_empty())
    }
}

impl Machine {
    /// Name of the cluster this machine belongs to, from the well-known label
    /// or, failing that, `spec.clusterName`.
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CLUSTER_NAME_LABEL))
            .map(String::as_str)
            .or_else(|| Some(self.spec.cluster_name.as_str()).filter(|n| !n.is_empty()))
    }
}
