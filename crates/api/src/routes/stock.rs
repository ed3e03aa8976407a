//! Stock and reservation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{ProductId, ReservationId, VariantId};
use inventory::{AdjustmentReason, AvailabilityReport, ReserveItem, Stock, StockReservation, StockStore};
use serde::Deserialize;

use super::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct AvailabilityRequest {
    pub items: Vec<ReserveItem>,
}

#[derive(Deserialize)]
pub struct AdjustStockRequest {
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub delta: i64,
    #[serde(default = "default_reason")]
    pub reason: AdjustmentReason,
}

fn default_reason() -> AdjustmentReason {
    AdjustmentReason::Adjustment
}

#[derive(Deserialize)]
pub struct SetStockRequest {
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub quantity: i64,
    #[serde(default)]
    pub low_stock_threshold: i64,
}

// -- Handlers --

/// POST /stock/availability: reports availability without reserving.
pub async fn availability<S: StockStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<AvailabilityRequest>,
) -> Result<Json<AvailabilityReport>, ApiError> {
    let report = state.engine.check_availability(&req.items).await?;
    Ok(Json(report))
}

/// POST /stock/adjust: changes the on-hand quantity.
pub async fn adjust<S: StockStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<AdjustStockRequest>,
) -> Result<Json<Stock>, ApiError> {
    let stock = state
        .engine
        .adjust_stock(&req.product_id, &req.variant_id, req.delta, req.reason)
        .await?;
    Ok(Json(stock))
}

/// PUT /stock: creates or overwrites a stock row.
pub async fn set<S: StockStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<SetStockRequest>,
) -> Result<Json<Stock>, ApiError> {
    let stock = state
        .engine
        .set_stock(
            &req.product_id,
            &req.variant_id,
            req.quantity,
            req.low_stock_threshold,
        )
        .await?;
    Ok(Json(stock))
}

/// GET /stock/{product_id}/{variant_id}
pub async fn get<S: StockStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((product_id, variant_id)): Path<(String, String)>,
) -> Result<Json<Stock>, ApiError> {
    let stock = state
        .engine
        .get_stock(&ProductId::new(product_id), &VariantId::new(variant_id))
        .await?;
    Ok(Json(stock))
}

/// GET /reservations/{id}
pub async fn reservation<S: StockStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<StockReservation>, ApiError> {
    let id: ReservationId = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid reservation id: {id}")))?;
    let reservation = state.engine.get_reservation(id).await?;
    Ok(Json(reservation))
}
