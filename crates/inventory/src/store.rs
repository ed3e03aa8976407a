//! Storage contract for the stock ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutId, ReservationId};

use crate::error::Result;
use crate::reservation::{ReservationLine, ReservationStatus, StockReservation};
use crate::stock::{Stock, StockKey};

/// Persistence for stock rows and reservations.
///
/// Every method that touches `(quantity, reserved)` must hold a row-level lock
/// on the affected stock rows for its whole duration, and batch operations must
/// be all-or-nothing.
#[async_trait]
pub trait StockStore: Send + Sync {
    /// Inserts or replaces a stock row's quantity and threshold, keeping its
    /// reserved count. Fails with `BelowReserved` if `quantity < reserved`.
    async fn put_stock(&self, key: &StockKey, quantity: i64, low_stock_threshold: i64)
    -> Result<Stock>;

    /// Loads a stock row.
    async fn get_stock(&self, key: &StockKey) -> Result<Option<Stock>>;

    /// Atomically reserves every line or none of them.
    ///
    /// Rows are locked in key order, every line is checked against
    /// `available`, and only then are counters incremented and reservations
    /// inserted. The error for a shortfall names the first failing line.
    async fn reserve_batch(
        &self,
        checkout_id: CheckoutId,
        lines: &[ReservationLine],
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>>;

    /// Moves an active reservation to a terminal status and applies the
    /// matching counter change, as one compare-and-set.
    ///
    /// `Released` and `Expired` decrement `reserved`; `Confirmed` decrements
    /// both `reserved` and `quantity`. Returns the updated reservation and row.
    async fn transition_reservation(
        &self,
        id: ReservationId,
        to: ReservationStatus,
    ) -> Result<(StockReservation, Stock)>;

    /// Adds `delta` to a row's on-hand quantity.
    async fn adjust_quantity(&self, key: &StockKey, delta: i64) -> Result<Stock>;

    /// Loads a reservation.
    async fn get_reservation(&self, id: ReservationId) -> Result<Option<StockReservation>>;

    /// Lists all reservations created for a checkout, oldest first.
    async fn reservations_for_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Vec<StockReservation>>;

    /// Lists active reservations whose TTL elapsed before `now`, oldest expiry first.
    async fn find_expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StockReservation>>;
}
