//! Checkout saga steps.

use serde::{Deserialize, Serialize};

/// A forward step of the checkout saga, or a compensating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStep {
    /// Hold stock for every item.
    ReserveStock,
    /// Create the order.
    CreateOrder,
    /// Charge the payment method.
    ChargePayment,
    /// Turn the holds into permanent deductions.
    ConfirmReservations,
    /// Compensation for `ReserveStock`.
    ReleaseReservations,
    /// Compensation for `CreateOrder`.
    CancelOrder,
}

impl SagaStep {
    /// Returns the step name used in logs, metrics and failure reasons.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::ReserveStock => "reserve_stock",
            SagaStep::CreateOrder => "create_order",
            SagaStep::ChargePayment => "charge_payment",
            SagaStep::ConfirmReservations => "confirm_reservations",
            SagaStep::ReleaseReservations => "release_reservations",
            SagaStep::CancelOrder => "cancel_order",
        }
    }

    /// Returns true if a shutdown may abandon the step.
    ///
    /// Only forward steps before the charge completes qualify. Confirmations
    /// and compensations always run to completion or their own timeout.
    pub fn observes_shutdown(&self) -> bool {
        matches!(
            self,
            SagaStep::ReserveStock | SagaStep::CreateOrder | SagaStep::ChargePayment
        )
    }

    /// Returns true for compensating actions.
    pub fn is_compensation(&self) -> bool {
        matches!(self, SagaStep::ReleaseReservations | SagaStep::CancelOrder)
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
