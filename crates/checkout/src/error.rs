//! Checkout error types.

use common::{CheckoutId, Classify, ErrorKind};
use inventory::InventoryError;
use thiserror::Error;

use crate::state::CheckoutStatus;
use crate::steps::SagaStep;

/// Errors that can occur while running a checkout.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// Bad request: empty items, unknown currency, negative amounts.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No session exists with the ID.
    #[error("Checkout session not found: {0}")]
    NotFound(CheckoutId),

    /// The session exists but is not in a state that allows the operation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The status change is not in the transition table.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: CheckoutStatus,
        to: CheckoutStatus,
    },

    /// A step exceeded its time budget.
    #[error("Step '{step}' timed out")]
    Timeout { step: SagaStep },

    /// The collaborator's breaker rejected the call.
    #[error("Service '{service}' is degraded: circuit open")]
    CircuitOpen { service: String },

    /// The process is shutting down and the step was abandoned.
    #[error("Step '{step}' cancelled by shutdown")]
    Cancelled { step: SagaStep },

    /// A collaborator answered with an error.
    #[error("{service} service error: {message}")]
    Downstream {
        service: String,
        kind: ErrorKind,
        message: String,
    },

    /// Inventory error.
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CheckoutError {
    /// Creates a downstream error.
    pub fn downstream(service: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        CheckoutError::Downstream {
            service: service.into(),
            kind,
            message: message.into(),
        }
    }

    /// Returns true if the error says the dependency itself is unhealthy.
    ///
    /// Business rejections (no stock, bad input, conflicts) mean the
    /// dependency answered and do not count against its circuit breaker.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::TransientInfra | ErrorKind::Internal
        ) && !matches!(self, CheckoutError::Cancelled { .. })
    }
}

impl Classify for CheckoutError {
    fn kind(&self) -> ErrorKind {
        match self {
            CheckoutError::Validation(_) => ErrorKind::Validation,
            CheckoutError::NotFound(_) => ErrorKind::NotFound,
            CheckoutError::Conflict(_) | CheckoutError::InvalidTransition { .. } => {
                ErrorKind::Conflict
            }
            CheckoutError::Timeout { .. } => ErrorKind::Timeout,
            CheckoutError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            CheckoutError::Cancelled { .. } => ErrorKind::TransientInfra,
            CheckoutError::Downstream { kind, .. } => *kind,
            CheckoutError::Inventory(e) => e.kind(),
            CheckoutError::Database(e) => inventory::error::classify_sqlx(e),
            CheckoutError::Serialization(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience type alias for checkout results.
pub type Result<T> = std::result::Result<T, CheckoutError>;
