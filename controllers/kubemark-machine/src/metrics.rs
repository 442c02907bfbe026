//! Prometheus metrics and health endpoints.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `kubemark_reconcile_total` | Counter | `outcome` |
//! | `kubemark_reconcile_errors_total` | Counter | `kind` |
//! | `kubemark_csr_submitted_total` | Counter | |
//! | `kubemark_bootstrap_duration_seconds` | Histogram | `result` |

use crate::error::ControllerError;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Buckets for certificate bootstrap duration, in seconds
const BOOTSTRAP_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Controller metrics registered in their own registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: CounterVec,
    reconcile_errors_total: CounterVec,
    csr_submitted_total: IntCounter,
    bootstrap_duration: HistogramVec,
}

impl Metrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();
        let metrics_error = |e: prometheus::Error| ControllerError::InvalidConfig(format!("metrics registration failed: {}", e));

        let reconcile_total = CounterVec::new(
            Opts::new("kubemark_reconcile_total", "Reconcile passes by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        registry.register(Box::new(reconcile_total.clone())).map_err(metrics_error)?;

        let reconcile_errors_total = CounterVec::new(
            Opts::new("kubemark_reconcile_errors_total", "Failed reconcile passes by error kind"),
            &["kind"],
        )
        .map_err(metrics_error)?;
        registry.register(Box::new(reconcile_errors_total.clone())).map_err(metrics_error)?;

        let csr_submitted_total = IntCounter::new("kubemark_csr_submitted_total", "CSRs submitted for hollow nodes")
            .map_err(metrics_error)?;
        registry.register(Box::new(csr_submitted_total.clone())).map_err(metrics_error)?;

        let bootstrap_duration = HistogramVec::new(
            HistogramOpts::new(
                "kubemark_bootstrap_duration_seconds",
                "Time spent in certificate bootstrap per reconcile pass",
            )
            .buckets(BOOTSTRAP_BUCKETS.to_vec()),
            &["result"],
        )
        .map_err(metrics_error)?;
        registry.register(Box::new(bootstrap_duration.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_errors_total,
            csr_submitted_total,
            bootstrap_duration,
        })
    }

    /// Count a finished reconcile pass
    pub fn reconcile_finished(&self, outcome: &str) {
        self.reconcile_total.with_label_values(&[outcome]).inc();
    }

    /// Count a failed reconcile pass
    pub fn reconcile_failed(&self, error: &ControllerError) {
        self.reconcile_total.with_label_values(&["error"]).inc();
        self.reconcile_errors_total.with_label_values(&[error.kind()]).inc();
    }

    /// Count a submitted CSR
    pub fn csr_submitted(&self) {
        self.csr_submitted_total.inc();
    }

    /// Record the time one bootstrap call took
    pub fn observe_bootstrap(&self, result: &str, elapsed: Duration) {
        self.bootstrap_duration
            .with_label_values(&[result])
            .observe(elapsed.as_secs_f64());
    }

    /// Encode all metrics in the Prometheus text format
    pub fn encode_text(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| ControllerError::Encoding(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| ControllerError::Encoding(format!("metrics are not UTF-8: {}", e)))
    }

    #[cfg(test)]
    pub(crate) fn csr_submitted_count(&self) -> u64 {
        self.csr_submitted_total.get()
    }

    #[cfg(test)]
    pub(crate) fn reconcile_count(&self, outcome: &str) -> f64 {
        self.reconcile_total.with_label_values(&[outcome]).get()
    }
}

#[derive(Clone)]
struct HealthState {
    metrics: Metrics,
    ready: Arc<AtomicBool>,
}

/// Serve `/metrics`, `/healthz` and `/readyz` until `shutdown` is cancelled
///
/// `/readyz` answers 503 until `ready` is set.
pub async fn serve(
    addr: SocketAddr,
    metrics: Metrics,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("cannot listen on {}: {}", addr, e)))?;
    info!("Serving metrics and health endpoints on {}", addr);

    axum::serve(listener, router(HealthState { metrics, ready }))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server failed: {}", e)))
}

fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}
