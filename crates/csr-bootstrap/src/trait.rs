//! CsrClient trait for mocking
//!
//! This trait abstracts the CSR API so the bootstrapper can be exercised in
//! unit tests without a cluster. `KubeCsrClient` implements it against the
//! Kubernetes API; `MockCsrClient` signs requests in memory.

use crate::error::CsrError;
use crate::identity::SigningRequest;

/// Trait for certificate signing request API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait CsrClient: Send + Sync {
    /// Submit a signing request, returning the name of the created CSR object
    async fn submit(&self, request: &SigningRequest) -> Result<String, CsrError>;

    /// Fetch the issued certificate (PEM) for a CSR
    ///
    /// Returns `Ok(None)` while the CSR is still waiting for approval or signing.
    async fn issued_certificate(&self, csr_name: &str) -> Result<Option<String>, CsrError>;
}
