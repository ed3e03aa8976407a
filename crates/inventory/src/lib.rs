//! Stock ledger and reservation engine.
//!
//! The engine exclusively owns `stock` and `stock_reservations` rows. Every
//! mutation of a stock row's `(quantity, reserved)` pair happens under a
//! row-level lock, so concurrent checkouts can never oversell a SKU.
//!
//! Two store implementations share the [`StockStore`] contract:
//! [`InMemoryStockStore`] for tests and single-process deployments, and
//! [`PostgresStockStore`] for production.

pub mod engine;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod reservation;
pub mod stock;
pub mod store;

pub use engine::{AvailabilityReport, EngineConfig, ItemAvailability, ReservationEngine, ReserveItem};
pub use error::{InventoryError, Result};
pub use memory::InMemoryStockStore;
pub use postgres::PostgresStockStore;
pub use reservation::{ReservationLine, ReservationStatus, StockReservation};
pub use stock::{AdjustmentReason, Stock, StockKey};
pub use store::StockStore;
