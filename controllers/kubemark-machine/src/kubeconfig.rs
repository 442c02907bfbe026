//! Kubeconfig documents for hollow nodes and bootstrap clients.
//!
//! `ClusterAccess` is the connection part of a workload cluster's kubeconfig.
//! From it we derive the kubeconfig mounted into the kubemark pod (client
//! certificate on disk) and the one used to submit CSRs (bootstrap token).

use crate::error::ControllerError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Cluster entry name used in generated kubeconfigs
pub const CLUSTER_ENTRY: &str = "default-cluster";
/// Credential entry name used in generated kubeconfigs
pub const AUTH_ENTRY: &str = "default-auth";
/// Context entry name used in generated kubeconfigs
pub const CONTEXT_ENTRY: &str = "default-context";

const CONTEXT_NAMESPACE: &str = "default";

/// Connection details of a target cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterAccess {
    /// API server URL
    pub host: String,
    /// Path of a CA bundle on disk
    pub ca_file: Option<String>,
    /// Inline CA bundle (PEM bytes)
    pub ca_data: Option<Vec<u8>>,
    /// Skip TLS verification
    pub insecure: bool,
}

/// Kubeconfig document (`kind: Config`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Kubeconfig {
    /// API version
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    /// Kind (always "Config")
    #[serde(default)]
    pub kind: String,
    /// Clusters
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    /// Users
    #[serde(default)]
    pub users: Vec<NamedUser>,
    /// Contexts
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    /// Current context
    #[serde(rename = "current-context", default)]
    pub current_context: String,
}

/// Cluster entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Entry name
    pub name: String,
    /// Cluster config
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    #[serde(default)]
    pub server: String,
    /// CA file path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
    /// CA certificate (base64 encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    /// Skip TLS verification
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_tls_verify: bool,
}

/// User entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedUser {
    /// Entry name
    pub name: String,
    /// User config
    #[serde(default)]
    pub user: UserConfig,
}

/// User configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Client certificate file path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    /// Client key file path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Context entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedContext {
    /// Entry name
    pub name: String,
    /// Context config
    #[serde(default)]
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    #[serde(default)]
    pub cluster: String,
    /// User name (reference)
    #[serde(default)]
    pub user: String,
    /// Default namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ClusterAccess {
    /// Read the connection part of a workload cluster kubeconfig
    ///
    /// Uses the cluster of the current context, or the first cluster when no
    /// current context is set.
    pub fn from_kubeconfig(yaml: &str) -> Result<Self, ControllerError> {
        let kubeconfig: Kubeconfig = serde_yaml::from_str(yaml)
            .map_err(|e| ControllerError::InvalidConfig(format!("unreadable kubeconfig: {}", e)))?;

        let cluster_name = kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == kubeconfig.current_context)
            .map(|c| c.context.cluster.as_str());
        let cluster = match cluster_name {
            Some(name) => kubeconfig.clusters.iter().find(|c| c.name == name),
            None => kubeconfig.clusters.first(),
        }
        .ok_or_else(|| ControllerError::InvalidConfig("kubeconfig has no usable cluster entry".to_string()))?;

        if cluster.cluster.server.is_empty() {
            return Err(ControllerError::InvalidConfig(format!(
                "kubeconfig cluster `{}` has no server",
                cluster.name
            )));
        }
        let ca_data = cluster
            .cluster
            .certificate_authority_data
            .as_deref()
            .map(|data| {
                BASE64.decode(data.trim()).map_err(|e| {
                    ControllerError::InvalidConfig(format!("invalid certificate-authority-data: {}", e))
                })
            })
            .transpose()?;

        Ok(Self {
            host: cluster.cluster.server.clone(),
            ca_file: cluster.cluster.certificate_authority.clone(),
            ca_data,
            insecure: cluster.cluster.insecure_skip_tls_verify,
        })
    }

    /// Cluster stanza: the CA file wins, inline CA data only without a file
    fn cluster_config(&self) -> ClusterConfig {
        let ca_file = self.ca_file.clone().filter(|f| !f.is_empty());
        let ca_data = match ca_file {
            Some(_) => None,
            None => self.ca_data.as_ref().map(|data| BASE64.encode(data)),
        };
        ClusterConfig {
            server: self.host.clone(),
            certificate_authority: ca_file,
            certificate_authority_data: ca_data,
            insecure_skip_tls_verify: self.insecure,
        }
    }
}

fn single_entry_kubeconfig(access: &ClusterAccess, user: UserConfig) -> Kubeconfig {
    Kubeconfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: CLUSTER_ENTRY.to_string(),
            cluster: access.cluster_config(),
        }],
        users: vec![NamedUser {
            name: AUTH_ENTRY.to_string(),
            user,
        }],
        contexts: vec![NamedContext {
            name: CONTEXT_ENTRY.to_string(),
            context: ContextConfig {
                cluster: CLUSTER_ENTRY.to_string(),
                user: AUTH_ENTRY.to_string(),
                namespace: Some(CONTEXT_NAMESPACE.to_string()),
            },
        }],
        current_context: CONTEXT_ENTRY.to_string(),
    }
}

fn to_yaml(kubeconfig: &Kubeconfig) -> Result<String, ControllerError> {
    serde_yaml::to_string(kubeconfig)
        .map_err(|e| ControllerError::Encoding(format!("failed to serialize kubeconfig: {}", e)))
}

/// Kubeconfig whose client certificate and key both live at `cert_path`
pub fn certificate_kubeconfig(access: &ClusterAccess, cert_path: &str) -> Result<String, ControllerError> {
    to_yaml(&single_entry_kubeconfig(
        access,
        UserConfig {
            client_certificate: Some(cert_path.to_string()),
            client_key: Some(cert_path.to_string()),
            token: None,
        },
    ))
}

/// Kubeconfig authenticating with a bootstrap token
pub fn token_kubeconfig(access: &ClusterAccess, token: &str) -> Result<String, ControllerError> {
    to_yaml(&single_entry_kubeconfig(
        access,
        UserConfig {
            token: Some(token.to_string()),
            ..Default::default()
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA_PEM: &[u8] = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn access() -> ClusterAccess {
        ClusterAccess {
            host: "https://10.0.0.1:6443".to_string(),
            ca_file: None,
            ca_data: Some(CA_PEM.to_vec()),
            insecure: false,
        }
    }

    fn parse(yaml: &str) -> Kubeconfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_certificate_kubeconfig_shape() {
        let yaml = certificate_kubeconfig(&access(), "/kubeconfig/cert.pem").unwrap();
        let kubeconfig = parse(&yaml);

        assert_eq!(kubeconfig.clusters.len(), 1);
        assert_eq!(kubeconfig.users.len(), 1);
        assert_eq!(kubeconfig.contexts.len(), 1);
        assert_eq!(kubeconfig.current_context, "default-context");
        assert_eq!(kubeconfig.clusters[0].name, "default-cluster");
        assert_eq!(kubeconfig.clusters[0].cluster.server, "https://10.0.0.1:6443");
        assert_eq!(kubeconfig.users[0].name, "default-auth");
        assert_eq!(kubeconfig.users[0].user.client_certificate.as_deref(), Some("/kubeconfig/cert.pem"));
        assert_eq!(kubeconfig.users[0].user.client_key.as_deref(), Some("/kubeconfig/cert.pem"));
        assert_eq!(kubeconfig.contexts[0].context.cluster, "default-cluster");
        assert_eq!(kubeconfig.contexts[0].context.user, "default-auth");
        assert_eq!(kubeconfig.contexts[0].context.namespace.as_deref(), Some("default"));
        assert!(yaml.contains("apiVersion: v1"));
        assert!(yaml.contains("current-context: default-context"));
    }

    #[test]
    fn test_inline_ca_used_without_ca_file() {
        let kubeconfig = parse(&certificate_kubeconfig(&access(), "/kubeconfig/cert.pem").unwrap());
        let cluster = &kubeconfig.clusters[0].cluster;

        assert!(cluster.certificate_authority.is_none());
        let data = BASE64.decode(cluster.certificate_authority_data.as_deref().unwrap()).unwrap();
        assert_eq!(data, CA_PEM);
    }

    #[test]
    fn test_ca_file_wins_over_inline_ca() {
        let mut access = access();
        access.ca_file = Some("/etc/kubernetes/pki/ca.crt".to_string());

        let kubeconfig = parse(&certificate_kubeconfig(&access, "/kubeconfig/cert.pem").unwrap());
        let cluster = &kubeconfig.clusters[0].cluster;

        assert_eq!(cluster.certificate_authority.as_deref(), Some("/etc/kubernetes/pki/ca.crt"));
        assert!(cluster.certificate_authority_data.is_none());
    }

    #[test]
    fn test_insecure_is_carried_over() {
        let mut access = access();
        access.insecure = true;
        let yaml = certificate_kubeconfig(&access, "/kubeconfig/cert.pem").unwrap();
        assert!(yaml.contains("insecure-skip-tls-verify: true"));

        let yaml = certificate_kubeconfig(&self::access(), "/kubeconfig/cert.pem").unwrap();
        assert!(!yaml.contains("insecure-skip-tls-verify"));
    }

    #[test]
    fn test_token_kubeconfig_is_loadable_by_kube() {
        let yaml = token_kubeconfig(&access(), "abcdef.0123456789abcdef").unwrap();
        let kubeconfig = parse(&yaml);

        assert_eq!(kubeconfig.users[0].user.token.as_deref(), Some("abcdef.0123456789abcdef"));
        assert!(kubeconfig.users[0].user.client_certificate.is_none());
        assert!(kube::config::Kubeconfig::from_yaml(&yaml).is_ok());
    }

    #[test]
    fn test_cluster_access_from_capi_kubeconfig() {
        let yaml = format!(
            r#"apiVersion: v1
kind: Config
clusters:
- name: workload
  cluster:
    server: https://workload.example:6443
    certificate-authority-data: {}
users:
- name: workload-admin
  user:
    client-certificate-data: Zm9v
    client-key-data: YmFy
contexts:
- name: workload-admin@workload
  context:
    cluster: workload
    user: workload-admin
current-context: workload-admin@workload
"#,
            BASE64.encode(CA_PEM)
        );

        let access = ClusterAccess::from_kubeconfig(&yaml).unwrap();

        assert_eq!(access.host, "https://workload.example:6443");
        assert_eq!(access.ca_data.as_deref(), Some(CA_PEM));
        assert!(access.ca_file.is_none());
        assert!(!access.insecure);
    }

    #[test]
    fn test_cluster_access_rejects_empty_kubeconfig() {
        let result = ClusterAccess::from_kubeconfig("apiVersion: v1\nkind: Config\n");
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }
}
