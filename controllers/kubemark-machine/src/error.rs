//! Controller-specific error types.
//!
//! NotFound and NotReady conditions are not errors here; the reconciler
//! reports them as `ReconcileOutcome::Absent` and `ReconcileOutcome::Deferred`.

use csr_bootstrap::BootstrapError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the KubemarkMachine Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// An encoded flag does not have the expected shape
    #[error("Malformed flag: {0}")]
    MalformedFlag(String),

    /// A kubeconfig or manifest could not be serialized
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Certificate bootstrap failed, timed out or was cancelled
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// Creating the identity bundle or the workload failed
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    /// Writing the provider ID or readiness back failed
    #[error("Status update failed: {0}")]
    StatusUpdateFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Short label used for the `kind` dimension of error metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::Kube(_) => "kube",
            ControllerError::MalformedFlag(_) => "malformed_flag",
            ControllerError::Encoding(_) => "encoding",
            ControllerError::Bootstrap(BootstrapError::Timeout { .. }) => "bootstrap_timeout",
            ControllerError::Bootstrap(BootstrapError::Cancelled(_)) => "bootstrap_cancelled",
            ControllerError::Bootstrap(BootstrapError::Failed { .. }) => "bootstrap_failed",
            ControllerError::SubmissionFailed(_) => "submission_failed",
            ControllerError::StatusUpdateFailed(_) => "status_update_failed",
            ControllerError::InvalidConfig(_) => "invalid_config",
            ControllerError::Watch(_) => "watch",
        }
    }
}
