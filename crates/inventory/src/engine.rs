//! Reservation engine: the public face of the stock ledger.
//!
//! The engine validates requests, resolves catalog identifiers to stock rows,
//! delegates the locked read-modify-write to a [`StockStore`], and emits
//! `stock.low` when available stock falls to its threshold.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use common::{CheckoutId, Clock, ProductId, ReservationId, SystemClock, VariantId, WarehouseId};
use events::{DomainEvent, SharedPublisher, StockLowData};
use serde::{Deserialize, Serialize};

use crate::error::{InventoryError, Result};
use crate::reservation::{ReservationLine, ReservationStatus, StockReservation};
use crate::stock::{AdjustmentReason, Stock, StockKey};
use crate::store::StockStore;

/// Configuration for the reservation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// TTL applied when a caller passes `ttl_secs = 0`.
    pub default_ttl_secs: u64,
    /// Warehouse that catalog lines are resolved against.
    pub default_warehouse: WarehouseId,
}

impl EngineConfig {
    /// Checks the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.default_ttl_secs == 0 {
            return Err("default_ttl_secs must be greater than 0".into());
        }
        if self.default_warehouse.as_str().is_empty() {
            return Err("default_warehouse must not be empty".into());
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 900,
            default_warehouse: WarehouseId::default(),
        }
    }
}

/// One line of a reservation or availability request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveItem {
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub quantity: i64,
}

impl ReserveItem {
    pub fn new(product_id: impl Into<ProductId>, variant_id: impl Into<VariantId>, quantity: i64) -> Self {
        Self {
            product_id: product_id.into(),
            variant_id: variant_id.into(),
            quantity,
        }
    }
}

/// Availability of one requested line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAvailability {
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub requested: i64,
    pub available: i64,
    pub is_available: bool,
}

/// Result of a read-only availability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub results: Vec<ItemAvailability>,
    pub all_available: bool,
}

/// Issues, confirms, releases and expires stock reservations.
pub struct ReservationEngine<S> {
    store: S,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    publisher: SharedPublisher,
}

impl<S: StockStore> ReservationEngine<S> {
    /// Creates an engine backed by the system clock.
    pub fn new(store: S, config: EngineConfig, publisher: SharedPublisher) -> Self {
        Self::with_clock(store, config, publisher, Arc::new(SystemClock))
    }

    /// Creates an engine with an explicit clock.
    pub fn with_clock(
        store: S,
        config: EngineConfig,
        publisher: SharedPublisher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            publisher,
        }
    }

    /// Gets a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn key(&self, product_id: &ProductId, variant_id: &VariantId) -> StockKey {
        StockKey {
            product_id: product_id.clone(),
            variant_id: variant_id.clone(),
            warehouse_id: self.config.default_warehouse.clone(),
        }
    }

    /// Reserves every item or none of them.
    ///
    /// Calling this again for a checkout that already holds active
    /// reservations returns the existing reservation IDs without reserving
    /// more stock. A `ttl_secs` of zero selects the configured default.
    #[tracing::instrument(skip(self, items), fields(items = items.len()))]
    pub async fn reserve_stock(
        &self,
        checkout_id: CheckoutId,
        items: &[ReserveItem],
        ttl_secs: u64,
    ) -> Result<Vec<ReservationId>> {
        validate_items(items)?;
        let mut seen = HashSet::with_capacity(items.len());
        for item in items {
            if !seen.insert((&item.product_id, &item.variant_id)) {
                return Err(InventoryError::InvalidInput(format!(
                    "duplicate line for {}/{}",
                    item.product_id, item.variant_id
                )));
            }
        }

        let existing = self.active_reservations(checkout_id).await?;
        if !existing.is_empty() {
            tracing::debug!("checkout already holds reservations");
            return Ok(existing);
        }

        let ttl_secs = if ttl_secs == 0 {
            self.config.default_ttl_secs
        } else {
            ttl_secs
        };
        let ttl = i64::try_from(ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| InventoryError::InvalidInput(format!("ttl {ttl_secs}s is out of range")))?;

        let now = self.clock.now();
        let lines: Vec<ReservationLine> = items
            .iter()
            .map(|item| ReservationLine {
                key: self.key(&item.product_id, &item.variant_id),
                quantity: item.quantity,
            })
            .collect();

        match self.store.reserve_batch(checkout_id, &lines, now + ttl, now).await {
            Ok(reservations) => {
                metrics::counter!("stock_reservations_total").increment(reservations.len() as u64);
                tracing::info!(count = reservations.len(), "stock reserved");
                Ok(reservations.into_iter().map(|r| r.id).collect())
            }
            Err(InventoryError::DuplicateReservation(_)) => {
                // A concurrent call for the same checkout won; hand back its holds.
                self.active_reservations(checkout_id).await
            }
            Err(e) => {
                if let InventoryError::InsufficientStock { key, .. } = &e {
                    metrics::counter!("stock_insufficient_total").increment(1);
                    tracing::info!(sku = %key, "insufficient stock");
                }
                Err(e)
            }
        }
    }

    /// IDs of the holds a checkout still has active.
    pub async fn active_reservations(&self, checkout_id: CheckoutId) -> Result<Vec<ReservationId>> {
        Ok(self
            .store
            .reservations_for_checkout(checkout_id)
            .await?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Active)
            .map(|r| r.id)
            .collect())
    }

    /// Gives a held reservation back: `active -> released`.
    #[tracing::instrument(skip(self))]
    pub async fn release_reservation(&self, id: ReservationId) -> Result<StockReservation> {
        let (reservation, _) = self
            .store
            .transition_reservation(id, ReservationStatus::Released)
            .await?;
        tracing::info!(sku = %reservation.key, quantity = reservation.quantity, "reservation released");
        Ok(reservation)
    }

    /// Turns a held reservation into a permanent deduction: `active -> confirmed`.
    #[tracing::instrument(skip(self))]
    pub async fn confirm_reservation(&self, id: ReservationId) -> Result<StockReservation> {
        let (reservation, stock) = self
            .store
            .transition_reservation(id, ReservationStatus::Confirmed)
            .await?;
        tracing::info!(sku = %reservation.key, quantity = reservation.quantity, "reservation confirmed");
        self.signal_if_low(&stock);
        Ok(reservation)
    }

    /// Expires a held reservation whose TTL elapsed: `active -> expired`.
    #[tracing::instrument(skip(self))]
    pub async fn expire_reservation(&self, id: ReservationId) -> Result<StockReservation> {
        let (reservation, _) = self
            .store
            .transition_reservation(id, ReservationStatus::Expired)
            .await?;
        tracing::info!(sku = %reservation.key, quantity = reservation.quantity, "reservation expired");
        Ok(reservation)
    }

    /// Expires up to `limit` active reservations past their TTL.
    ///
    /// A reservation confirmed or released between the scan and its
    /// transition is skipped. Returns the number actually expired.
    #[tracing::instrument(skip(self))]
    pub async fn expire_due(&self, limit: usize) -> Result<usize> {
        let due = self
            .store
            .find_expired_reservations(self.clock.now(), limit)
            .await?;

        let mut expired = 0;
        for reservation in due {
            match self.expire_reservation(reservation.id).await {
                Ok(_) => expired += 1,
                Err(InventoryError::InvalidTransition { status, .. }) => {
                    tracing::debug!(reservation_id = %reservation.id, %status, "reservation settled before expiry");
                }
                Err(e) => {
                    tracing::warn!(reservation_id = %reservation.id, error = %e, "failed to expire reservation");
                }
            }
        }
        Ok(expired)
    }

    /// Reports whether each line could be reserved right now. Mutates nothing.
    ///
    /// Lines for unknown SKUs report zero available.
    pub async fn check_availability(&self, items: &[ReserveItem]) -> Result<AvailabilityReport> {
        validate_items(items)?;

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let available = self
                .store
                .get_stock(&self.key(&item.product_id, &item.variant_id))
                .await?
                .map(|s| s.available())
                .unwrap_or(0);
            results.push(ItemAvailability {
                product_id: item.product_id.clone(),
                variant_id: item.variant_id.clone(),
                requested: item.quantity,
                available,
                is_available: available >= item.quantity,
            });
        }

        let all_available = results.iter().all(|r| r.is_available);
        Ok(AvailabilityReport {
            results,
            all_available,
        })
    }

    /// Adds `delta` to the on-hand quantity outside the checkout flow.
    #[tracing::instrument(skip(self))]
    pub async fn adjust_stock(
        &self,
        product_id: &ProductId,
        variant_id: &VariantId,
        delta: i64,
        reason: AdjustmentReason,
    ) -> Result<Stock> {
        if delta == 0 {
            return Err(InventoryError::InvalidInput("delta must not be zero".into()));
        }
        let stock = self
            .store
            .adjust_quantity(&self.key(product_id, variant_id), delta)
            .await?;
        tracing::info!(sku = %stock.key, delta, %reason, quantity = stock.quantity, "stock adjusted");
        self.signal_if_low(&stock);
        Ok(stock)
    }

    /// Creates or overwrites a stock row. The reserved count is kept.
    #[tracing::instrument(skip(self))]
    pub async fn set_stock(
        &self,
        product_id: &ProductId,
        variant_id: &VariantId,
        quantity: i64,
        low_stock_threshold: i64,
    ) -> Result<Stock> {
        if quantity < 0 {
            return Err(InventoryError::InvalidInput("quantity must not be negative".into()));
        }
        if low_stock_threshold < 0 {
            return Err(InventoryError::InvalidInput(
                "low_stock_threshold must not be negative".into(),
            ));
        }
        self.store
            .put_stock(&self.key(product_id, variant_id), quantity, low_stock_threshold)
            .await
    }

    pub async fn get_stock(&self, product_id: &ProductId, variant_id: &VariantId) -> Result<Stock> {
        let key = self.key(product_id, variant_id);
        self.store
            .get_stock(&key)
            .await?
            .ok_or(InventoryError::StockNotFound(key))
    }

    pub async fn get_reservation(&self, id: ReservationId) -> Result<StockReservation> {
        self.store
            .get_reservation(id)
            .await?
            .ok_or(InventoryError::ReservationNotFound(id))
    }

    pub async fn reservations_for_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Vec<StockReservation>> {
        self.store.reservations_for_checkout(checkout_id).await
    }

    fn signal_if_low(&self, stock: &Stock) {
        if !stock.is_low() {
            return;
        }
        tracing::info!(sku = %stock.key, available = stock.available(), "stock low");
        self.publisher.publish(DomainEvent::StockLow(StockLowData {
            product_id: stock.key.product_id.clone(),
            variant_id: stock.key.variant_id.clone(),
            warehouse_id: stock.key.warehouse_id.clone(),
            available: stock.available(),
            threshold: stock.low_stock_threshold,
            detected_at: self.clock.now(),
        }));
    }
}

fn validate_items(items: &[ReserveItem]) -> Result<()> {
    if items.is_empty() {
        return Err(InventoryError::InvalidInput("items must not be empty".into()));
    }
    if let Some(item) = items.iter().find(|i| i.quantity <= 0) {
        return Err(InventoryError::InvalidInput(format!(
            "quantity for {}/{} must be positive, got {}",
            item.product_id, item.variant_id, item.quantity
        )));
    }
    Ok(())
}
