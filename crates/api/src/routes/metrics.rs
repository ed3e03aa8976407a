//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use checkout::CheckoutCoordinator;
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::CircuitState;

/// State for the metrics router.
#[derive(Clone)]
pub struct MetricsState {
    pub handle: PrometheusHandle,
    pub coordinator: Arc<CheckoutCoordinator>,
}

/// GET /metrics: returns Prometheus-formatted metrics.
///
/// Breaker states are sampled into the `circuit_breaker_state` gauge on each
/// scrape (0 closed, 1 half-open, 2 open).
pub async fn get(State(metrics): State<MetricsState>) -> impl IntoResponse {
    for breaker in metrics.coordinator.breakers() {
        let value = match breaker.state() {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        metrics::gauge!("circuit_breaker_state", "name" => breaker.name().to_string()).set(value);
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.handle.render(),
    )
}
