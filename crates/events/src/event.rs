//! Domain event payloads.

use chrono::{DateTime, Utc};
use common::{CheckoutId, Currency, Money, OrderId, PaymentId, ProductId, UserId, VariantId, WarehouseId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events published for external consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    /// Payment succeeded and reservations were confirmed.
    #[serde(rename = "checkout.completed")]
    CheckoutCompleted(CheckoutCompletedData),

    /// A saga step failed and compensation ran.
    #[serde(rename = "checkout.failed")]
    CheckoutFailed(CheckoutFailedData),

    /// The reaper expired an incomplete session.
    #[serde(rename = "checkout.expired")]
    CheckoutExpired(CheckoutExpiredData),

    /// Available stock fell to or below the low-stock threshold.
    #[serde(rename = "stock.low")]
    StockLow(StockLowData),
}

impl DomainEvent {
    /// Returns the wire name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::CheckoutCompleted(_) => "checkout.completed",
            DomainEvent::CheckoutFailed(_) => "checkout.failed",
            DomainEvent::CheckoutExpired(_) => "checkout.expired",
            DomainEvent::StockLow(_) => "stock.low",
        }
    }
}

/// Data for `checkout.completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutCompletedData {
    pub checkout_id: CheckoutId,
    pub user_id: UserId,
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub total_amount: Money,
    pub currency: Currency,
    pub completed_at: DateTime<Utc>,
}

/// Data for `checkout.failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutFailedData {
    pub checkout_id: CheckoutId,
    pub user_id: UserId,
    /// Step that failed.
    pub step: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Data for `checkout.expired`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutExpiredData {
    pub checkout_id: CheckoutId,
    pub user_id: UserId,
    /// Status the session was in when it expired.
    pub previous_status: String,
    pub expired_at: DateTime<Utc>,
}

/// Data for `stock.low`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockLowData {
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    pub available: i64,
    pub threshold: i64,
    pub detected_at: DateTime<Utc>,
}

/// An event wrapped with delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique per publish; consumers use it to de-duplicate at-least-once deliveries.
    pub event_id: Uuid,
    pub event_type: String,
    pub published_at: DateTime<Utc>,
    pub payload: DomainEvent,
}

impl EventEnvelope {
    /// Wraps an event with a fresh ID and the current time.
    pub fn wrap(payload: DomainEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: payload.event_type().to_string(),
            published_at: Utc::now(),
            payload,
        }
    }
}
