//! Health check endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use inventory::StockStore;
use resilience::CircuitState;
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// `degraded` while any collaborator's breaker is not closed.
    pub status: &'static str,
    pub storage: &'static str,
    pub breakers: BTreeMap<String, CircuitState>,
}

/// GET /health: returns process health and breaker states.
pub async fn check<S: StockStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    let breakers: BTreeMap<String, CircuitState> = state
        .coordinator
        .breakers()
        .into_iter()
        .map(|b| (b.name().to_string(), b.state()))
        .collect();
    let degraded = breakers.values().any(|s| *s != CircuitState::Closed);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        storage: state.storage,
        breakers,
    })
}
