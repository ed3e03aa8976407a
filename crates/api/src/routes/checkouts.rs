//! Checkout endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use checkout::{CheckoutSession, StartCheckout};
use common::CheckoutId;
use inventory::StockStore;

use super::AppState;
use crate::error::ApiError;

fn parse_checkout_id(id: &str) -> Result<CheckoutId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid checkout id: {id}")))
}

/// POST /checkouts: runs a checkout to completion.
///
/// A saga that ran and failed still answers 201: the body carries the
/// `failed` status and `failure_reason`. Only requests rejected before the
/// saga starts map to error statuses.
pub async fn create<S: StockStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<StartCheckout>,
) -> Result<(StatusCode, Json<CheckoutSession>), ApiError> {
    let session = state.coordinator.start_checkout(req).await?;
    tracing::info!(checkout_id = %session.id, status = %session.status, "checkout finished");
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /checkouts/{id}: returns the session.
pub async fn get<S: StockStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CheckoutSession>, ApiError> {
    let id = parse_checkout_id(&id)?;
    let session = state.coordinator.get_session(id).await?;
    Ok(Json(session))
}
