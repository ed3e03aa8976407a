use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutId, ReservationId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{InventoryError, Result};
use crate::reservation::{ReservationLine, ReservationStatus, StockReservation};
use crate::stock::{Stock, StockKey};
use crate::store::StockStore;

/// In-memory stock store.
///
/// Each stock row sits behind its own async mutex, which plays the role of a
/// row-level lock. Multi-row operations acquire row locks in key order, so two
/// batches contending for the same SKUs can never deadlock. Lock order is
/// always rows first, then the reservation table.
#[derive(Clone, Default)]
pub struct InMemoryStockStore {
    rows: Arc<RwLock<HashMap<StockKey, Arc<Mutex<Stock>>>>>,
    reservations: Arc<RwLock<HashMap<ReservationId, StockReservation>>>,
}

impl InMemoryStockStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every stock row.
    pub async fn all_stock(&self) -> Vec<Stock> {
        let rows: Vec<_> = self.rows.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.lock().await.clone());
        }
        out
    }

    /// Returns the number of reservations in any status.
    pub async fn reservation_count(&self) -> usize {
        self.reservations.read().await.len()
    }

    async fn row(&self, key: &StockKey) -> Result<Arc<Mutex<Stock>>> {
        self.rows
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| InventoryError::StockNotFound(key.clone()))
    }

    async fn lock_rows(
        &self,
        keys: BTreeSet<&StockKey>,
    ) -> Result<HashMap<StockKey, OwnedMutexGuard<Stock>>> {
        let mut guards = HashMap::with_capacity(keys.len());
        for key in keys {
            let row = self.row(key).await?;
            guards.insert(key.clone(), row.lock_owned().await);
        }
        Ok(guards)
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn put_stock(
        &self,
        key: &StockKey,
        quantity: i64,
        low_stock_threshold: i64,
    ) -> Result<Stock> {
        let existing = self.rows.read().await.get(key).cloned();
        let row = match existing {
            Some(row) => row,
            None => {
                let mut rows = self.rows.write().await;
                rows.entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(Stock::new(key.clone(), 0, 0))))
                    .clone()
            }
        };

        let mut stock = row.lock().await;
        if quantity < stock.reserved {
            return Err(InventoryError::BelowReserved {
                key: key.clone(),
                quantity,
                reserved: stock.reserved,
            });
        }
        stock.quantity = quantity;
        stock.low_stock_threshold = low_stock_threshold;
        Ok(stock.clone())
    }

    async fn get_stock(&self, key: &StockKey) -> Result<Option<Stock>> {
        let row = self.rows.read().await.get(key).cloned();
        match row {
            Some(row) => Ok(Some(row.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn reserve_batch(
        &self,
        checkout_id: CheckoutId,
        lines: &[ReservationLine],
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>> {
        let mut guards = self.lock_rows(lines.iter().map(|l| &l.key).collect()).await?;
        let mut reservations = self.reservations.write().await;

        if reservations
            .values()
            .any(|r| r.checkout_id == checkout_id && r.status == ReservationStatus::Active)
        {
            return Err(InventoryError::DuplicateReservation(checkout_id));
        }

        // Check every line before touching any counter.
        let mut pending: HashMap<&StockKey, i64> = HashMap::new();
        for line in lines {
            let stock = &guards[&line.key];
            let already = pending.get(&line.key).copied().unwrap_or(0);
            let available = stock.available() - already;
            if available < line.quantity {
                return Err(InventoryError::InsufficientStock {
                    key: line.key.clone(),
                    requested: line.quantity,
                    available,
                });
            }
            pending.insert(&line.key, already + line.quantity);
        }

        let mut created = Vec::with_capacity(lines.len());
        for line in lines {
            if let Some(stock) = guards.get_mut(&line.key) {
                stock.reserved += line.quantity;
            }
            let reservation = StockReservation {
                id: ReservationId::new(),
                key: line.key.clone(),
                quantity: line.quantity,
                checkout_id,
                status: ReservationStatus::Active,
                expires_at,
                created_at: now,
            };
            reservations.insert(reservation.id, reservation.clone());
            created.push(reservation);
        }

        Ok(created)
    }

    async fn transition_reservation(
        &self,
        id: ReservationId,
        to: ReservationStatus,
    ) -> Result<(StockReservation, Stock)> {
        let snapshot = self
            .reservations
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(InventoryError::ReservationNotFound(id))?;
        if !snapshot.status.can_transition_to(to) {
            return Err(InventoryError::InvalidTransition {
                id,
                status: snapshot.status,
                to,
            });
        }

        let row = self.row(&snapshot.key).await?;
        let mut stock = row.lock().await;
        let mut reservations = self.reservations.write().await;
        let reservation = reservations
            .get_mut(&id)
            .ok_or(InventoryError::ReservationNotFound(id))?;

        // Re-check under the locks: a concurrent transition may have won.
        if !reservation.status.can_transition_to(to) {
            return Err(InventoryError::InvalidTransition {
                id,
                status: reservation.status,
                to,
            });
        }
        if stock.reserved < reservation.quantity {
            return Err(InventoryError::Corrupt(format!(
                "{} has reserved {} but reservation {} holds {}",
                stock.key, stock.reserved, id, reservation.quantity
            )));
        }

        stock.reserved -= reservation.quantity;
        if to == ReservationStatus::Confirmed {
            stock.quantity -= reservation.quantity;
        }
        reservation.status = to;

        Ok((reservation.clone(), stock.clone()))
    }

    async fn adjust_quantity(&self, key: &StockKey, delta: i64) -> Result<Stock> {
        let row = self.row(key).await?;
        let mut stock = row.lock().await;
        let quantity = stock
            .quantity
            .checked_add(delta)
            .ok_or_else(|| InventoryError::InvalidInput(format!("delta {delta} overflows")))?;
        if quantity < 0 {
            return Err(InventoryError::InvalidInput(format!(
                "adjusting {key} by {delta} would make quantity negative"
            )));
        }
        if quantity < stock.reserved {
            return Err(InventoryError::BelowReserved {
                key: key.clone(),
                quantity,
                reserved: stock.reserved,
            });
        }
        stock.quantity = quantity;
        Ok(stock.clone())
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<StockReservation>> {
        Ok(self.reservations.read().await.get(&id).cloned())
    }

    async fn reservations_for_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Vec<StockReservation>> {
        let mut found: Vec<_> = self
            .reservations
            .read()
            .await
            .values()
            .filter(|r| r.checkout_id == checkout_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.created_at, r.id));
        Ok(found)
    }

    async fn find_expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StockReservation>> {
        let mut due: Vec<_> = self
            .reservations
            .read()
            .await
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.expires_at, r.id));
        due.truncate(limit);
        Ok(due)
    }
}
