//! Payment collaborator contract and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use common::{CheckoutId, Currency, ErrorKind, Money, OrderId, PaymentId};

use crate::error::{CheckoutError, Result};

/// A charge against the customer's payment method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Repeating a charge with the same key returns the original payment.
    pub idempotency_key: CheckoutId,
    pub order_id: OrderId,
    pub amount: Money,
    pub currency: Currency,
    pub method: Option<String>,
}

/// Payment operations used by the saga.
///
/// The gateway protocol is opaque; a charge either yields a payment ID or an error.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges the customer.
    async fn charge(&self, request: ChargeRequest) -> Result<PaymentId>;
}

/// A payment held by [`InMemoryPaymentService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub id: PaymentId,
    pub request: ChargeRequest,
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<CheckoutId, PaymentRecord>,
    attempts: u32,
    fail_on_charge: bool,
    decline: bool,
    charge_delay: Option<Duration>,
}

/// In-memory payment service for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryPaymentState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryPaymentState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Configures the service to fail every charge as if the gateway were down.
    pub fn set_fail_on_charge(&self, fail: bool) {
        self.write().fail_on_charge = fail;
    }

    /// Configures the service to decline every charge.
    pub fn set_decline(&self, decline: bool) {
        self.write().decline = decline;
    }

    /// Delays every charge, to exercise step timeouts.
    pub fn set_charge_delay(&self, delay: Option<Duration>) {
        self.write().charge_delay = delay;
    }

    /// Returns the number of successful payments.
    pub fn payment_count(&self) -> usize {
        self.read().payments.len()
    }

    /// Returns the number of charge calls that reached the service.
    pub fn charge_attempts(&self) -> u32 {
        self.read().attempts
    }

    /// Returns the payment made for a checkout, if any.
    pub fn payment_for_checkout(&self, checkout_id: CheckoutId) -> Option<PaymentRecord> {
        self.read().payments.get(&checkout_id).cloned()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(&self, request: ChargeRequest) -> Result<PaymentId> {
        let delay = {
            let mut state = self.write();
            state.attempts += 1;
            state.charge_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        if state.fail_on_charge {
            return Err(CheckoutError::downstream(
                "payment",
                ErrorKind::TransientInfra,
                "payment gateway unavailable",
            ));
        }
        if state.decline {
            return Err(CheckoutError::downstream(
                "payment",
                ErrorKind::Validation,
                "payment declined",
            ));
        }
        if let Some(existing) = state.payments.get(&request.idempotency_key) {
            return Ok(existing.id);
        }

        let id = PaymentId::new();
        state
            .payments
            .insert(request.idempotency_key, PaymentRecord { id, request });
        Ok(id)
    }
}
