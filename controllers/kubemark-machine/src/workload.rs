//! Identity bundle and hollow node workload assembly.
//!
//! Both builders are pure; creating the objects in the workload cluster is
//! the reconciler's job.

use crate::error::ControllerError;
use crate::flags::{self, EXTENDED_RESOURCES_FLAG, NODE_LABELS_FLAG};
use crds::KubemarkMachine;
use csr_bootstrap::ClientIdentity;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, SecurityContext,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Namespace of the identity bundle and the hollow node workload
pub const SYSTEM_NAMESPACE: &str = "kube-system";
/// Mount point of the identity bundle inside the kubemark container
pub const IDENTITY_MOUNT_PATH: &str = "/kubeconfig";
/// Path of the stacked certificate/key inside the container
pub const IDENTITY_CERT_PATH: &str = "/kubeconfig/cert.pem";
/// Identity bundle key holding the kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";
/// Identity bundle key holding the stacked certificate/key
pub const CERT_KEY: &str = "cert.pem";

const CONTAINER_NAME: &str = "kubemark";
const VOLUME_NAME: &str = "kubeconfig";
const KUBEMARK_COMMAND: &str = "/kubemark";
const KUBELET_LOG_FILE: &str = "/var/log/kubelet.log";
const APP_LABEL: &str = "app";
const CONTROL_PLANE_TAINT: &str = "node-role.kubernetes.io/control-plane";

/// Kubeconfig plus stacked certificate/key for one hollow node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityBundle {
    /// Bundle name (the KubemarkMachine name)
    pub name: String,
    /// Kubeconfig referencing `IDENTITY_CERT_PATH`
    pub kubeconfig: String,
    /// Certificate PEM immediately followed by key PEM
    pub cert_pem: String,
}

impl IdentityBundle {
    /// The bundle as a ConfigMap in `kube-system`
    pub fn to_config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(SYSTEM_NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (KUBECONFIG_KEY.to_string(), self.kubeconfig.clone()),
                (CERT_KEY.to_string(), self.cert_pem.clone()),
            ])),
            ..Default::default()
        }
    }
}

/// Builds identity bundles and hollow node Deployments
#[derive(Debug, Clone)]
pub struct WorkloadAssembler {
    image: String,
}

impl WorkloadAssembler {
    /// Assembler producing workloads that run `image`
    pub fn new(image: impl Into<String>) -> Self {
        Self { image: image.into() }
    }

    /// Pair a kubeconfig with the PEM-stacked identity
    pub fn identity_bundle(&self, name: &str, kubeconfig: String, identity: &ClientIdentity) -> IdentityBundle {
        IdentityBundle {
            name: name.to_string(),
            kubeconfig,
            cert_pem: identity.stacked_pem(),
        }
    }

    /// Single-replica Deployment running kubemark as a hollow kubelet
    pub fn workload_descriptor(
        &self,
        machine: &KubemarkMachine,
        bundle: &IdentityBundle,
    ) -> Result<Deployment, ControllerError> {
        let name = machine.name_any();
        let labels = BTreeMap::from([(APP_LABEL.to_string(), name.clone())]);

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            command: Some(vec![KUBEMARK_COMMAND.to_string()]),
            args: Some(kubemark_args(machine)?),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: VOLUME_NAME.to_string(),
                mount_path: IDENTITY_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(SYSTEM_NAMESPACE.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        tolerations: Some(vec![Toleration {
                            key: Some(CONTROL_PLANE_TAINT.to_string()),
                            effect: Some("NoSchedule".to_string()),
                            ..Default::default()
                        }]),
                        volumes: Some(vec![Volume {
                            name: VOLUME_NAME.to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: bundle.name.clone(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

/// kubemark argument vector for `machine`
///
/// Flags whose encoded value is empty are left out. Every encoded mapping is
/// decoded again so a key or value that would not survive the trip (one
/// containing `,` or `=`) is rejected instead of silently mangled.
pub fn kubemark_args(machine: &KubemarkMachine) -> Result<Vec<String>, ControllerError> {
    let spec = &machine.spec;

    let resources = flags::encode_resources(&spec.extended_resources);
    let expected: BTreeMap<String, String> = spec
        .extended_resources
        .iter()
        .map(|(k, q)| (k.clone(), q.0.clone()))
        .collect();
    check_round_trip(EXTENDED_RESOURCES_FLAG, &resources, &expected)?;

    let labels = flags::encode_labels(&spec.node_labels);
    check_round_trip(NODE_LABELS_FLAG, &labels, &spec.node_labels)?;

    let taints = flags::encode_taints(&spec.register_with_taints);
    if flags::decode_taints(&taints)? != spec.register_with_taints {
        return Err(ControllerError::MalformedFlag(format!(
            "taints of {} cannot be encoded losslessly",
            machine.name_any()
        )));
    }

    let mut args = vec![
        "--v=3".to_string(),
        "--morph=kubelet".to_string(),
        format!("--log-file={}", KUBELET_LOG_FILE),
        "--logtostderr=false".to_string(),
    ];
    if !taints.is_empty() {
        args.push(taints);
    }
    args.push(format!("--name={}", machine.name_any()));
    if !resources.is_empty() {
        args.push(resources);
    }
    if !labels.is_empty() {
        args.push(labels);
    }
    Ok(args)
}

fn check_round_trip(
    flag: &str,
    encoded: &str,
    expected: &BTreeMap<String, String>,
) -> Result<(), ControllerError> {
    if &flags::decode(flag, encoded)? != expected {
        return Err(ControllerError::MalformedFlag(format!(
            "{} value cannot be encoded losslessly",
            flag
        )));
    }
    Ok(())
}
