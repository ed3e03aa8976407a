//! Inventory error types.

use common::{CheckoutId, Classify, ErrorKind, ReservationId};
use thiserror::Error;

use crate::reservation::ReservationStatus;
use crate::stock::StockKey;

/// Errors that can occur in the stock ledger and reservation engine.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Bad request: empty batch, non-positive quantity, duplicate line.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No stock row exists for the key.
    #[error("Stock not found: {0}")]
    StockNotFound(StockKey),

    /// No reservation exists with the ID.
    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// Not enough available stock. Names the first failing SKU of a batch.
    #[error("Insufficient stock for {key}: requested {requested}, available {available}")]
    InsufficientStock {
        key: StockKey,
        requested: i64,
        available: i64,
    },

    /// The reservation is not in a state that allows the transition.
    #[error("Reservation {id} is {status}, cannot transition to {to}")]
    InvalidTransition {
        id: ReservationId,
        status: ReservationStatus,
        to: ReservationStatus,
    },

    /// A concurrent batch already placed active reservations for this checkout.
    #[error("Checkout {0} already holds active reservations")]
    DuplicateReservation(CheckoutId),

    /// The change would leave fewer units on hand than are reserved.
    #[error("Stock {key} cannot go to {quantity}: {reserved} units are reserved")]
    BelowReserved {
        key: StockKey,
        quantity: i64,
        reserved: i64,
    },

    /// A stored row violates a ledger invariant.
    #[error("Ledger invariant violated: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Classify for InventoryError {
    fn kind(&self) -> ErrorKind {
        match self {
            InventoryError::InvalidInput(_) => ErrorKind::Validation,
            InventoryError::StockNotFound(_) | InventoryError::ReservationNotFound(_) => {
                ErrorKind::NotFound
            }
            InventoryError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            InventoryError::InvalidTransition { .. }
            | InventoryError::DuplicateReservation(_)
            | InventoryError::BelowReserved { .. } => ErrorKind::Conflict,
            InventoryError::Corrupt(_) => ErrorKind::Internal,
            InventoryError::Database(e) => classify_sqlx(e),
        }
    }
}

/// Classifies a database error. Connection-level failures are transient.
pub fn classify_sqlx(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => ErrorKind::TransientInfra,
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        _ => ErrorKind::Internal,
    }
}

/// Convenience type alias for inventory results.
pub type Result<T> = std::result::Result<T, InventoryError>;
