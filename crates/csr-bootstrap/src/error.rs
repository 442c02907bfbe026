//! Certificate bootstrap errors

use thiserror::Error;

/// Errors returned by a CSR API client
#[derive(Debug, Error)]
pub enum CsrError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The CSR object no longer exists
    #[error("CSR not found: {0}")]
    NotFound(String),

    /// The CSR was denied by an approver
    #[error("CSR denied: {0}")]
    Denied(String),

    /// The signer failed to issue a certificate
    #[error("CSR failed: {0}")]
    Failed(String),

    /// The CSR API returned something unusable
    #[error("CSR API error: {0}")]
    Api(String),
}

/// Errors returned by a certificate store
#[derive(Debug, Error)]
pub enum StoreError {
    /// No certificate/key pair is available yet
    #[error("no certificate/key pair available yet")]
    NoCertKey,

    /// The stored certificate or key could not be parsed
    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// The stored certificate is outside its validity window
    #[error("certificate is not currently valid: {0}")]
    NotValid(String),
}

/// Errors that end a bootstrap attempt
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// No certificate was issued before the deadline
    #[error("certificate for {key} not issued within {timeout_secs}s")]
    Timeout {
        /// Request key of the timed out session
        key: String,
        /// Configured deadline in seconds
        timeout_secs: u64,
    },

    /// Key generation, CSR submission or polling failed
    #[error("certificate bootstrap for {key} failed: {reason}")]
    Failed {
        /// Request key of the failed session
        key: String,
        /// Failure description
        reason: String,
    },

    /// The caller cancelled the wait
    #[error("certificate bootstrap for {0} cancelled")]
    Cancelled(String),
}

impl BootstrapError {
    pub(crate) fn failed(key: &str, reason: impl std::fmt::Display) -> Self {
        BootstrapError::Failed {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}
