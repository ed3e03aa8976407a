//! Order collaborator contract and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use common::{CheckoutId, Currency, ErrorKind, OrderId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{CheckoutError, Result};
use crate::session::{Address, CheckoutItem, CheckoutSession, Totals};

/// The status of an order.
///
/// State transitions:
/// ```text
/// Pending ──► Confirmed ──► Processing ──► Shipped ──► Delivered ──► Refunded
///    │            │
///    └────────────┴──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    /// Terminal state.
    Cancelled,
    /// Terminal state.
    Refunded,
}

impl OrderStatus {
    /// Returns true if `self -> to` is listed in the transition table.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Processing)
                | (Confirmed, Cancelled)
                | (Processing, Shipped)
                | (Shipped, Delivered)
                | (Delivered, Refunded)
        )
    }

    /// Returns true if the order can still be cancelled.
    pub fn can_cancel(&self) -> bool {
        self.can_transition_to(OrderStatus::Cancelled)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the order service needs to create an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user_id: UserId,
    pub items: Vec<CheckoutItem>,
    pub totals: Totals,
    pub currency: Currency,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
}

impl From<&CheckoutSession> for OrderRequest {
    fn from(session: &CheckoutSession) -> Self {
        Self {
            user_id: session.user_id,
            items: session.items.clone(),
            totals: session.totals(),
            currency: session.currency.clone(),
            shipping_address: session.shipping_address.clone(),
            billing_address: session.billing_address.clone(),
        }
    }
}

/// Order operations used by the saga.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Creates an order. Repeating the call for the same checkout returns the same order.
    async fn create_order(&self, checkout_id: CheckoutId, request: OrderRequest)
    -> Result<OrderId>;

    /// Cancels an order (compensation).
    async fn cancel_order(&self, order_id: OrderId, reason: &str) -> Result<()>;
}

/// An order held by [`InMemoryOrderService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub id: OrderId,
    pub checkout_id: CheckoutId,
    pub status: OrderStatus,
    pub request: OrderRequest,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Default)]
struct InMemoryOrderState {
    orders: HashMap<OrderId, OrderRecord>,
    by_checkout: HashMap<CheckoutId, OrderId>,
    fail_on_create: bool,
    fail_on_cancel: bool,
    create_delay: Option<Duration>,
}

/// In-memory order service for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderService {
    state: Arc<RwLock<InMemoryOrderState>>,
}

impl InMemoryOrderService {
    /// Creates a new in-memory order service.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryOrderState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryOrderState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Configures the service to fail every create call.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.write().fail_on_create = fail;
    }

    /// Configures the service to fail every cancel call.
    pub fn set_fail_on_cancel(&self, fail: bool) {
        self.write().fail_on_cancel = fail;
    }

    /// Delays every create call, to exercise step timeouts.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        self.write().create_delay = delay;
    }

    /// Returns the number of orders created.
    pub fn order_count(&self) -> usize {
        self.read().orders.len()
    }

    /// Returns the order, if any.
    pub fn order(&self, order_id: OrderId) -> Option<OrderRecord> {
        self.read().orders.get(&order_id).cloned()
    }

    /// Returns the order created for a checkout, if any.
    pub fn order_for_checkout(&self, checkout_id: CheckoutId) -> Option<OrderRecord> {
        let state = self.read();
        state
            .by_checkout
            .get(&checkout_id)
            .and_then(|id| state.orders.get(id))
            .cloned()
    }

    /// Moves an order along the fulfilment lifecycle.
    pub fn advance(&self, order_id: OrderId, to: OrderStatus) -> Result<OrderStatus> {
        let mut state = self.write();
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| CheckoutError::downstream("order", ErrorKind::NotFound, format!("order {order_id} not found")))?;
        if !order.status.can_transition_to(to) {
            return Err(CheckoutError::downstream(
                "order",
                ErrorKind::Conflict,
                format!("order {order_id} is {}, cannot become {to}", order.status),
            ));
        }
        order.status = to;
        Ok(to)
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn create_order(
        &self,
        checkout_id: CheckoutId,
        request: OrderRequest,
    ) -> Result<OrderId> {
        let delay = self.read().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        if state.fail_on_create {
            return Err(CheckoutError::downstream(
                "order",
                ErrorKind::TransientInfra,
                "order service unavailable",
            ));
        }
        if let Some(existing) = state.by_checkout.get(&checkout_id) {
            return Ok(*existing);
        }

        let id = OrderId::new();
        state.orders.insert(
            id,
            OrderRecord {
                id,
                checkout_id,
                status: OrderStatus::Pending,
                request,
                cancel_reason: None,
            },
        );
        state.by_checkout.insert(checkout_id, id);
        Ok(id)
    }

    async fn cancel_order(&self, order_id: OrderId, reason: &str) -> Result<()> {
        let mut state = self.write();
        if state.fail_on_cancel {
            return Err(CheckoutError::downstream(
                "order",
                ErrorKind::TransientInfra,
                "order service unavailable",
            ));
        }
        let order = state.orders.get_mut(&order_id).ok_or_else(|| {
            CheckoutError::downstream("order", ErrorKind::NotFound, format!("order {order_id} not found"))
        })?;
        if !order.status.can_cancel() {
            return Err(CheckoutError::downstream(
                "order",
                ErrorKind::Conflict,
                format!("order {order_id} is {}, cannot be cancelled", order.status),
            ));
        }
        order.status = OrderStatus::Cancelled;
        order.cancel_reason = Some(reason.to_string());
        Ok(())
    }
}
