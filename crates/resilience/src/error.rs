//! Circuit breaker error types.

use common::{Classify, ErrorKind};
use thiserror::Error;

use crate::state::CircuitState;

/// Describes why a call was rejected without being attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    /// Name of the breaker that rejected the call.
    pub breaker: String,
    /// State the breaker was in.
    pub state: CircuitState,
}

/// Errors returned by [`CircuitBreaker::call`](crate::CircuitBreaker::call).
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open.
    #[error("circuit breaker '{0}' is open")]
    Open(String),

    /// The breaker is half-open and its probe budget is used up.
    #[error("circuit breaker '{0}' is half-open and has no probe slots left")]
    TooManyRequests(String),

    /// The wrapped call ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns the rejection details if the call was never attempted.
    pub fn rejection(&self) -> Option<Rejected> {
        match self {
            BreakerError::Open(name) => Some(Rejected {
                breaker: name.clone(),
                state: CircuitState::Open,
            }),
            BreakerError::TooManyRequests(name) => Some(Rejected {
                breaker: name.clone(),
                state: CircuitState::HalfOpen,
            }),
            BreakerError::Inner(_) => None,
        }
    }

    /// Returns the inner error if the call was attempted.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: Classify> Classify for BreakerError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            BreakerError::Open(_) | BreakerError::TooManyRequests(_) => ErrorKind::CircuitOpen,
            BreakerError::Inner(e) => e.kind(),
        }
    }
}
