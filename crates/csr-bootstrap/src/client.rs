//! CSR client backed by the Kubernetes `certificates.k8s.io/v1` API

use crate::csr_trait::CsrClient;
use crate::error::CsrError;
use crate::identity::SigningRequest;
use k8s_openapi::ByteString;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestSpec, CertificateSigningRequestStatus,
};
use kube::Api;
use kube::api::{ObjectMeta, PostParams};
use tracing::debug;
use uuid::Uuid;

const CSR_NAME_PREFIX: &str = "node-csr-";

/// Submits and polls CSR objects in a cluster
///
/// Built from a client that authenticates with the bootstrap credential.
#[derive(Clone)]
pub struct KubeCsrClient {
    api: Api<CertificateSigningRequest>,
}

impl KubeCsrClient {
    /// Create a CSR client over a cluster client
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait::async_trait]
impl CsrClient for KubeCsrClient {
    async fn submit(&self, request: &SigningRequest) -> Result<String, CsrError> {
        let name = format!("{}{}", CSR_NAME_PREFIX, Uuid::new_v4().simple());
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request.csr_pem.as_bytes().to_vec()),
                signer_name: request.signer_name.clone(),
                usages: Some(request.usages.clone()),
                ..Default::default()
            },
            status: None,
        };

        let created = self.api.create(&PostParams::default(), &csr).await?;
        let created_name = created.metadata.name.unwrap_or(name);
        debug!("Created CSR {} for {}", created_name, request.common_name);
        Ok(created_name)
    }

    async fn issued_certificate(&self, csr_name: &str) -> Result<Option<String>, CsrError> {
        let csr = self
            .api
            .get_opt(csr_name)
            .await?
            .ok_or_else(|| CsrError::NotFound(csr_name.to_string()))?;

        match csr.status {
            Some(status) => certificate_from_status(csr_name, status),
            None => Ok(None),
        }
    }
}

/// Interpret a CSR status: denied/failed conditions win over any certificate
fn certificate_from_status(
    csr_name: &str,
    status: CertificateSigningRequestStatus,
) -> Result<Option<String>, CsrError> {
    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        let detail = || {
            format!(
                "{}: {}",
                csr_name,
                condition
                    .message
                    .as_deref()
                    .or(condition.reason.as_deref())
                    .unwrap_or("no reason given")
            )
        };
        match condition.type_.as_str() {
            "Denied" => return Err(CsrError::Denied(detail())),
            "Failed" => return Err(CsrError::Failed(detail())),
            _ => {}
        }
    }

    match status.certificate {
        Some(ByteString(bytes)) if !bytes.is_empty() => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| CsrError::Api(format!("{}: certificate is not UTF-8: {}", csr_name, e))),
        _ => Ok(None),
    }
}
