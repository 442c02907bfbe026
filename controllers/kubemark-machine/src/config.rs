//! Controller configuration loaded from environment variables.

use crate::error::ControllerError;
use csr_bootstrap::BootstrapConfig;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Image run by every hollow node unless `KUBEMARK_IMAGE` overrides it
pub const DEFAULT_KUBEMARK_IMAGE: &str = "gcr.io/cf-london-servces-k8s/bmo/kubemark@sha256:9f717e0f2fc1b00c72719f157c1a3846ab8180070c201b950cade504c12dec59";

/// Runtime configuration of the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Kubemark container image
    pub kubemark_image: String,
    /// Certificate bootstrap polling limits
    pub bootstrap: BootstrapConfig,
    /// Timeout applied to clients of workload clusters
    pub remote_client_timeout: Duration,
    /// Maximum number of concurrent reconciliations
    pub reconcile_concurrency: u16,
    /// Requeue delay when a dependency is not ready yet
    pub defer_requeue: Duration,
    /// Listen address of the metrics and health server
    pub metrics_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            kubemark_image: DEFAULT_KUBEMARK_IMAGE.to_string(),
            bootstrap: BootstrapConfig::default(),
            remote_client_timeout: Duration::from_secs(30),
            reconcile_concurrency: 4,
            defer_requeue: Duration::from_secs(30),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for unset variables
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let bootstrap = BootstrapConfig {
            poll_interval: seconds(&lookup, "BOOTSTRAP_POLL_INTERVAL_SECS", defaults.bootstrap.poll_interval)?,
            timeout: seconds(&lookup, "BOOTSTRAP_TIMEOUT_SECS", defaults.bootstrap.timeout)?,
            poll_window: seconds(&lookup, "BOOTSTRAP_POLL_WINDOW_SECS", defaults.bootstrap.poll_window)?,
            session_ttl: seconds(&lookup, "BOOTSTRAP_SESSION_TTL_SECS", defaults.bootstrap.session_ttl)?,
        };
        if bootstrap.poll_interval.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "BOOTSTRAP_POLL_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if bootstrap.session_ttl < bootstrap.timeout {
            return Err(ControllerError::InvalidConfig(
                "BOOTSTRAP_SESSION_TTL_SECS must not be shorter than BOOTSTRAP_TIMEOUT_SECS".to_string(),
            ));
        }

        let reconcile_concurrency = match lookup("RECONCILE_CONCURRENCY") {
            Some(value) => value.trim().parse::<u16>().ok().filter(|n| *n > 0).ok_or_else(|| {
                ControllerError::InvalidConfig(format!(
                    "RECONCILE_CONCURRENCY must be a positive integer, got '{}'",
                    value
                ))
            })?,
            None => defaults.reconcile_concurrency,
        };

        let metrics_addr = match lookup("METRICS_ADDR") {
            Some(value) => value.trim().parse::<SocketAddr>().map_err(|e| {
                ControllerError::InvalidConfig(format!("METRICS_ADDR '{}' is not a socket address: {}", value, e))
            })?,
            None => defaults.metrics_addr,
        };

        Ok(Self {
            namespace: lookup("WATCH_NAMESPACE"),
            kubemark_image: lookup("KUBEMARK_IMAGE").unwrap_or(defaults.kubemark_image),
            bootstrap,
            remote_client_timeout: seconds(&lookup, "REMOTE_CLIENT_TIMEOUT_SECS", defaults.remote_client_timeout)?,
            reconcile_concurrency,
            defer_requeue: seconds(&lookup, "DEFER_REQUEUE_SECS", defaults.defer_requeue)?,
            metrics_addr,
        })
    }
}

fn seconds<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| {
            ControllerError::InvalidConfig(format!("{} must be a whole number of seconds, got '{}'", name, value))
        }),
        None => Ok(default),
    }
}
