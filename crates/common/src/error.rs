//! Closed error taxonomy shared by every crate.

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure.
///
/// Retry and compensation decisions match on this enum rather than on
/// error messages, so every decision point is exhaustive and type-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input: empty items, unknown currency, negative amounts.
    Validation,
    /// Unknown session, reservation or SKU.
    NotFound,
    /// Not enough available stock for a requested quantity.
    InsufficientStock,
    /// Invalid state transition or concurrent modification.
    Conflict,
    /// A step exceeded its time budget.
    Timeout,
    /// A circuit breaker rejected the call without attempting it.
    CircuitOpen,
    /// Connection-level failure that may succeed on retry.
    TransientInfra,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Returns true if the storage layer may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientInfra)
    }

    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::TransientInfra => "transient_infra",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error type that can be classified into an [`ErrorKind`].
pub trait Classify {
    /// Returns the error's kind.
    fn kind(&self) -> ErrorKind;
}
