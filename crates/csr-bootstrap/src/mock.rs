//! Mock CSR client for testing
//!
//! Signs submitted requests with an in-memory test CA. Behavior can be tuned
//! per test: answer "not yet" for a number of polls, never issue, deny, fail
//! submissions, issue an already expired certificate, or issue certificates
//! with a short lifetime.

use crate::csr_trait::CsrClient;
use crate::error::CsrError;
use crate::identity::SigningRequest;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct PendingCsr {
    request: SigningRequest,
    polls: u32,
}

/// Mock CSR client with call counters
#[derive(Clone)]
pub struct MockCsrClient {
    ca_cert_pem: Arc<String>,
    ca_key_pem: Arc<String>,
    csrs: Arc<Mutex<HashMap<String, PendingCsr>>>,
    pending_polls: Arc<Mutex<u32>>,
    issuing: Arc<AtomicBool>,
    expired: Arc<AtomicBool>,
    validity: Arc<Mutex<Option<Duration>>>,
    submit_error: Arc<Mutex<Option<String>>>,
    deny_reason: Arc<Mutex<Option<String>>>,
    submissions: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
}

impl MockCsrClient {
    /// Create a mock that issues on the first poll
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().expect("generate test CA key");
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("kubernetes-test-ca".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        let ca_cert = params.self_signed(&ca_key).expect("self-sign test CA");

        Self {
            ca_cert_pem: Arc::new(ca_cert.pem()),
            ca_key_pem: Arc::new(ca_key.serialize_pem()),
            csrs: Arc::new(Mutex::new(HashMap::new())),
            pending_polls: Arc::new(Mutex::new(0)),
            issuing: Arc::new(AtomicBool::new(true)),
            expired: Arc::new(AtomicBool::new(false)),
            validity: Arc::new(Mutex::new(None)),
            submit_error: Arc::new(Mutex::new(None)),
            deny_reason: Arc::new(Mutex::new(None)),
            submissions: Arc::new(AtomicUsize::new(0)),
            polls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer "not yet" for the first `polls` polls of every CSR
    pub fn with_pending_polls(self, polls: u32) -> Self {
        *self.pending_polls.lock().unwrap() = polls;
        self
    }

    /// Never issue a certificate
    pub fn never_issue(self) -> Self {
        self.set_issuing(false);
        self
    }

    /// Fail every submission with `reason`
    pub fn fail_submissions(self, reason: &str) -> Self {
        *self.submit_error.lock().unwrap() = Some(reason.to_string());
        self
    }

    /// Deny every CSR with `reason`
    pub fn deny(self, reason: &str) -> Self {
        *self.deny_reason.lock().unwrap() = Some(reason.to_string());
        self
    }

    /// Issue certificates whose validity ended long ago
    pub fn issue_expired(self) -> Self {
        self.expired.store(true, Ordering::SeqCst);
        self
    }

    /// Issue certificates that expire `validity` after signing
    pub fn with_validity(self, validity: Duration) -> Self {
        *self.validity.lock().unwrap() = Some(validity);
        self
    }

    /// Switch issuing on or off for subsequent polls
    pub fn set_issuing(&self, issuing: bool) {
        self.issuing.store(issuing, Ordering::SeqCst);
    }

    /// Number of CSRs submitted
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Number of polls made
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn sign(&self, request: &SigningRequest) -> Result<String, CsrError> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(&request.csr_pem)
            .map_err(|e| CsrError::Api(format!("invalid CSR: {}", e)))?;

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(request.common_name.clone()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(request.organization.clone()),
        );
        csr_params.params.distinguished_name = dn;
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        if self.expired.load(Ordering::SeqCst) {
            csr_params.params.not_before = rcgen::date_time_ymd(2000, 1, 1);
            csr_params.params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        } else if let Some(validity) = *self.validity.lock().unwrap() {
            let now = ::time::OffsetDateTime::now_utc();
            csr_params.params.not_before = now - ::time::Duration::minutes(1);
            csr_params.params.not_after = now + validity;
        }

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| CsrError::Api(format!("invalid CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| CsrError::Api(format!("invalid CA: {}", e)))?;
        let cert = csr_params
            .signed_by(&issuer)
            .map_err(|e| CsrError::Api(format!("signing failed: {}", e)))?;

        // Signers append the chain after the leaf
        Ok(format!("{}{}", cert.pem(), self.ca_cert_pem))
    }
}

impl Default for MockCsrClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CsrClient for MockCsrClient {
    async fn submit(&self, request: &SigningRequest) -> Result<String, CsrError> {
        if let Some(reason) = self.submit_error.lock().unwrap().clone() {
            return Err(CsrError::Api(reason));
        }

        let number = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("node-csr-mock-{}", number);
        self.csrs.lock().unwrap().insert(
            name.clone(),
            PendingCsr {
                request: request.clone(),
                polls: 0,
            },
        );
        Ok(name)
    }

    async fn issued_certificate(&self, csr_name: &str) -> Result<Option<String>, CsrError> {
        self.polls.fetch_add(1, Ordering::SeqCst);

        if let Some(reason) = self.deny_reason.lock().unwrap().clone() {
            return Err(CsrError::Denied(format!("{}: {}", csr_name, reason)));
        }

        let request = {
            let mut csrs = self.csrs.lock().unwrap();
            let csr = csrs
                .get_mut(csr_name)
                .ok_or_else(|| CsrError::NotFound(csr_name.to_string()))?;
            csr.polls += 1;
            let still_pending = csr.polls <= *self.pending_polls.lock().unwrap();
            if still_pending || !self.issuing.load(Ordering::SeqCst) {
                return Ok(None);
            }
            csr.request.clone()
        };

        self.sign(&request).map(Some)
    }
}
