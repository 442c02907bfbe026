//! Identity requests, signing requests and issued client identities

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use std::fmt;
use x509_parser::prelude::*;

/// Signer that issues kubelet client certificates
pub const KUBELET_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client-kubelet";

/// Key usages requested for kubelet client certificates
pub const KUBELET_CLIENT_USAGES: [&str; 3] = ["digital signature", "key encipherment", "client auth"];

/// Organization every node identity belongs to
pub const NODES_ORGANIZATION: &str = "system:nodes";

const CERTIFICATE_BLOCK: &str = "CERTIFICATE";

/// The identity a node asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRequest {
    /// Single-flight key (`<namespace>/<name>`)
    pub key: String,
    /// Subject common name
    pub common_name: String,
    /// Subject organization
    pub organization: String,
}

impl IdentityRequest {
    /// Identity of the node `name` requested from `namespace`
    pub fn for_node(namespace: &str, name: &str) -> Self {
        Self {
            key: format!("{}/{}", namespace, name),
            common_name: format!("system:node:{}", name),
            organization: NODES_ORGANIZATION.to_string(),
        }
    }
}

/// A PEM-encoded CSR ready to be submitted to a signer
#[derive(Debug, Clone)]
pub struct SigningRequest {
    /// Key of the identity request this CSR belongs to
    pub key: String,
    /// Subject common name
    pub common_name: String,
    /// Subject organization
    pub organization: String,
    /// PKCS#10 request in PEM format
    pub csr_pem: String,
    /// Signer expected to issue the certificate
    pub signer_name: String,
    /// Requested key usages
    pub usages: Vec<String>,
}

impl SigningRequest {
    /// Build a CSR for `request` signed with `key_pair`
    pub fn new(request: &IdentityRequest, key_pair: &KeyPair) -> Result<Self, rcgen::Error> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(request.common_name.clone()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(request.organization.clone()),
        );
        params.distinguished_name = dn;

        let csr = params.serialize_request(key_pair)?;
        let csr_pem = csr.pem()?;

        Ok(Self {
            key: request.key.clone(),
            common_name: request.common_name.clone(),
            organization: request.organization.clone(),
            csr_pem,
            signer_name: KUBELET_CLIENT_SIGNER.to_string(),
            usages: KUBELET_CLIENT_USAGES.iter().map(|u| u.to_string()).collect(),
        })
    }
}

/// An issued client certificate with its private key
///
/// Only ever held in memory; the `Debug` output never includes the key.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    certificate_pem: String,
    private_key_pem: String,
    common_name: String,
    not_after: DateTime<Utc>,
}

impl ClientIdentity {
    /// Validate an issued certificate and pair it with its private key
    ///
    /// The first `CERTIFICATE` block is taken as the leaf and re-encoded on its
    /// own; any chain the signer appended is dropped. Fails when the leaf does
    /// not parse, the key does not parse, or the leaf is outside its validity
    /// window right now.
    pub fn from_pem(certificate_pem: &str, private_key_pem: &str) -> Result<Self, StoreError> {
        let leaf_der = ::pem::parse_many(certificate_pem)
            .map_err(|e| StoreError::Parse(format!("failed to parse certificate PEM: {}", e)))?
            .into_iter()
            .find(|block| block.tag() == CERTIFICATE_BLOCK)
            .ok_or_else(|| StoreError::Parse("no CERTIFICATE block in issued certificate".to_string()))?
            .into_contents();

        let (_, cert) = X509Certificate::from_der(&leaf_der)
            .map_err(|e| StoreError::Parse(format!("failed to parse certificate: {}", e)))?;

        let validity = cert.validity();
        if !validity.is_valid() {
            return Err(StoreError::NotValid(format!(
                "valid from {} until {}",
                validity.not_before, validity.not_after
            )));
        }
        let not_after = DateTime::<Utc>::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| StoreError::Parse("certificate expiry out of range".to_string()))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        KeyPair::from_pem(private_key_pem)
            .map_err(|e| StoreError::Parse(format!("failed to parse private key: {}", e)))?;

        let certificate_pem = ::pem::encode_config(
            &::pem::Pem::new(CERTIFICATE_BLOCK, leaf_der.clone()),
            ::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF),
        );

        Ok(Self {
            certificate_pem,
            private_key_pem: with_trailing_newline(private_key_pem),
            common_name,
            not_after,
        })
    }

    /// PEM-encoded leaf certificate
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// PEM-encoded private key
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Subject common name of the certificate
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Expiry of the certificate
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Certificate block immediately followed by the key block, no separator
    pub fn stacked_pem(&self) -> String {
        let mut stacked = String::with_capacity(self.certificate_pem.len() + self.private_key_pem.len());
        stacked.push_str(&self.certificate_pem);
        stacked.push_str(&self.private_key_pem);
        stacked
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("common_name", &self.common_name)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn with_trailing_newline(pem: &str) -> String {
    if pem.ends_with('\n') {
        pem.to_string()
    } else {
        format!("{}\n", pem)
    }
}
