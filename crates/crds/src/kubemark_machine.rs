//! KubemarkMachine CRD
//!
//! Requests one simulated (hollow) node backed by a kubemark process
//! running inside the target cluster.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scheme prefix of the provider ID reported for kubemark nodes.
pub const PROVIDER_ID_PREFIX: &str = "kubemark://";

/// Extended resources advertised by the simulated node, keyed by resource name
/// (e.g. `cpu`, `memory`, `nvidia.com/gpu`).
pub type KubemarkExtendedResourceList = BTreeMap<String, Quantity>;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha4",
    kind = "KubemarkMachine",
    namespaced,
    status = "KubemarkMachineStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".status.providerID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubemarkMachineSpec {
    /// Extended resources the hollow kubelet registers on its node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(with = "BTreeMap<String, String>")]
    pub extended_resources: KubemarkExtendedResourceList,

    /// Labels the hollow kubelet registers on its node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,

    /// Taints the hollow kubelet registers on its node, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub register_with_taints: Vec<KubemarkTaint>,
}

/// A node taint as understood by `--register-with-taints`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubemarkTaint {
    /// Taint key
    pub key: String,

    /// Taint value (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Taint effect
    pub effect: TaintEffect,
}

impl KubemarkTaint {
    /// Create a taint with a value
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            effect,
        }
    }

    /// Create a taint without a value
    pub fn without_value(key: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: None,
            effect,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
/// Taint effect
///
/// Serializes as PascalCase, which is also the textual form kubelet flags expect.
pub enum TaintEffect {
    /// Do not schedule new pods onto the node
    NoSchedule,

    /// Avoid scheduling new pods onto the node when possible
    PreferNoSchedule,

    /// Evict running pods that do not tolerate the taint
    NoExecute,
}

impl TaintEffect {
    /// The effect name as used by Kubernetes
    pub fn as_str(&self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaintEffect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoSchedule" => Ok(TaintEffect::NoSchedule),
            "PreferNoSchedule" => Ok(TaintEffect::PreferNoSchedule),
            "NoExecute" => Ok(TaintEffect::NoExecute),
            other => Err(format!("unknown taint effect `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubemarkMachineStatus {
    /// True once the identity bundle and the hollow node workload exist
    #[serde(default)]
    pub ready: bool,

    /// Provider ID reported for the hollow node (`kubemark://<name>`)
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl KubemarkMachine {
    /// Whether a previous pass already provisioned this machine
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }
}

/// Provider ID for a kubemark machine name
pub fn provider_id_for(name: &str) -> String {
    format!("{}{}", PROVIDER_ID_PREFIX, name)
}
