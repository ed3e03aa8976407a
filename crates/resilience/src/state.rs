//! Circuit breaker state machine.

use serde::{Deserialize, Serialize};

/// The state of a circuit breaker.
///
/// State transitions:
/// ```text
/// Closed ──(failure ratio tripped)──► Open ──(timeout elapsed)──► HalfOpen
///   ▲                                  ▲                             │
///   │                                  └────────(probe fails)────────┤
///   └──────────────(max_requests consecutive probe successes)────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// All calls pass through.
    #[default]
    Closed,

    /// A limited number of probe calls are allowed through.
    HalfOpen,

    /// Calls are rejected without being attempted.
    Open,
}

impl CircuitState {
    /// Returns true if calls are allowed at all in this state.
    pub fn admits_calls(&self) -> bool {
        !matches!(self, CircuitState::Open)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_closed() {
        assert_eq!(CircuitState::default(), CircuitState::Closed);
    }

    #[test]
    fn test_admits_calls() {
        assert!(CircuitState::Closed.admits_calls());
        assert!(CircuitState::HalfOpen.admits_calls());
        assert!(!CircuitState::Open.admits_calls());
    }

    #[test]
    fn test_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::Open.to_string(), "open");
    }
}
