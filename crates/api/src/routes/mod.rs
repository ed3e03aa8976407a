//! HTTP route handlers.

pub mod checkouts;
pub mod health;
pub mod metrics;
pub mod stock;

use std::sync::Arc;

use checkout::CheckoutCoordinator;
use inventory::{ReservationEngine, StockStore};

/// Shared application state accessible from all handlers.
pub struct AppState<S: StockStore> {
    pub coordinator: Arc<CheckoutCoordinator>,
    pub engine: Arc<ReservationEngine<S>>,
    /// Backend name reported by the health check.
    pub storage: &'static str,
}
