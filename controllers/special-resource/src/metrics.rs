//! Prometheus metrics and the health/metrics HTTP endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::info;

use crate::error::ControllerError;

/// Sink for per-state completion
pub trait Metrics: Send + Sync {
    /// `value` is 1 once every replica of a state was applied, 0 on failure
    fn set_completed_state(&self, resource: &str, state: &str, value: i64);
}

/// Metrics registered in a private Prometheus registry
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    completed_states: IntGaugeVec,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();
        let completed_states = IntGaugeVec::new(
            Opts::new(
                "sro_completed_states",
                "For a given SpecialResource and state, 1 if the state is completed, 0 if it is not",
            ),
            &["cr", "state"],
        )?;
        registry.register(Box::new(completed_states.clone()))?;
        Ok(Self {
            registry,
            completed_states,
        })
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, ControllerError> {
        let mut buffer = String::new();
        TextEncoder::new().encode_utf8(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

impl Metrics for PrometheusMetrics {
    fn set_completed_state(&self, resource: &str, state: &str, value: i64) {
        self.completed_states
            .with_label_values(&[resource, state])
            .set(value);
    }
}

async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> Result<String, (StatusCode, String)> {
    metrics
        .render()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

pub fn router(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .with_state(metrics)
}

/// Serve `/metrics`, `/healthz` and `/readyz` until the listener fails
pub async fn serve(addr: SocketAddr, metrics: Arc<PrometheusMetrics>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("cannot bind metrics address {}: {}", addr, e)))?;
    info!("Metrics server listening on {}", addr);
    axum::serve(listener, router(metrics))
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server error: {}", e)))
}
