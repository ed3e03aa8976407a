//! Inventory collaborator contract.

use async_trait::async_trait;
use common::{CheckoutId, ReservationId};
use inventory::{ReservationEngine, ReserveItem, StockStore};

use crate::error::Result;

/// Stock reservation operations used by the saga.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves every item or none. Repeating the call for the same checkout
    /// returns the holds already placed.
    async fn reserve_stock(
        &self,
        checkout_id: CheckoutId,
        items: &[ReserveItem],
        ttl_secs: u64,
    ) -> Result<Vec<ReservationId>>;

    /// Releases a held reservation (compensation).
    async fn release_reservation(&self, id: ReservationId) -> Result<()>;

    /// Confirms a held reservation after payment.
    async fn confirm_reservation(&self, id: ReservationId) -> Result<()>;

    /// Active holds placed for a checkout, recorded on the session or not.
    async fn active_reservations(&self, checkout_id: CheckoutId) -> Result<Vec<ReservationId>>;
}

/// The reservation engine serves the contract in-process.
#[async_trait]
impl<S: StockStore + 'static> InventoryService for ReservationEngine<S> {
    async fn reserve_stock(
        &self,
        checkout_id: CheckoutId,
        items: &[ReserveItem],
        ttl_secs: u64,
    ) -> Result<Vec<ReservationId>> {
        Ok(ReservationEngine::reserve_stock(self, checkout_id, items, ttl_secs).await?)
    }

    async fn release_reservation(&self, id: ReservationId) -> Result<()> {
        ReservationEngine::release_reservation(self, id).await?;
        Ok(())
    }

    async fn confirm_reservation(&self, id: ReservationId) -> Result<()> {
        ReservationEngine::confirm_reservation(self, id).await?;
        Ok(())
    }

    async fn active_reservations(&self, checkout_id: CheckoutId) -> Result<Vec<ReservationId>> {
        Ok(ReservationEngine::active_reservations(self, checkout_id).await?)
    }
}
