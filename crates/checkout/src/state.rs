//! Checkout session state machine.

use serde::{Deserialize, Serialize};

/// The status of a checkout session.
///
/// State transitions:
/// ```text
/// Initiated ──► ItemsReserved ──► PaymentPending ──► Completed
///     │               │                 │
///     ├──► Failed ◄───┴─────────────────┤
///     └──► Expired ◄──────────(any non-terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    /// Session persisted, no step has committed yet.
    #[default]
    Initiated,

    /// Stock is held for every item.
    ItemsReserved,

    /// The order exists and payment is in flight.
    PaymentPending,

    /// Payment succeeded and reservations were confirmed (terminal state).
    Completed,

    /// A step failed and compensation ran (terminal state).
    Failed,

    /// The reaper reclaimed the session after its TTL (terminal state).
    Expired,
}

impl CheckoutStatus {
    /// Every status, in saga order.
    pub const ALL: [CheckoutStatus; 6] = [
        CheckoutStatus::Initiated,
        CheckoutStatus::ItemsReserved,
        CheckoutStatus::PaymentPending,
        CheckoutStatus::Completed,
        CheckoutStatus::Failed,
        CheckoutStatus::Expired,
    ];

    /// Returns true if `self -> to` is listed in the transition table.
    pub fn can_transition_to(&self, to: CheckoutStatus) -> bool {
        use CheckoutStatus::*;
        matches!(
            (self, to),
            (Initiated, ItemsReserved)
                | (ItemsReserved, PaymentPending)
                | (PaymentPending, Completed)
                | (Initiated | ItemsReserved | PaymentPending, Failed)
                | (Initiated | ItemsReserved | PaymentPending, Expired)
        )
    }

    /// Returns true if the saga may start running from this status.
    pub fn can_execute(&self) -> bool {
        matches!(self, CheckoutStatus::Initiated)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckoutStatus::Completed | CheckoutStatus::Failed | CheckoutStatus::Expired
        )
    }

    /// Returns the status name as stored and serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutStatus::Initiated => "initiated",
            CheckoutStatus::ItemsReserved => "items_reserved",
            CheckoutStatus::PaymentPending => "payment_pending",
            CheckoutStatus::Completed => "completed",
            CheckoutStatus::Failed => "failed",
            CheckoutStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for CheckoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CheckoutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckoutStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown checkout status: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_initiated() {
        assert_eq!(CheckoutStatus::default(), CheckoutStatus::Initiated);
    }

    #[test]
    fn test_transition_table() {
        use CheckoutStatus::*;
        let allowed = [
            (Initiated, ItemsReserved),
            (Initiated, Failed),
            (Initiated, Expired),
            (ItemsReserved, PaymentPending),
            (ItemsReserved, Failed),
            (ItemsReserved, Expired),
            (PaymentPending, Completed),
            (PaymentPending, Failed),
            (PaymentPending, Expired),
        ];
        for from in CheckoutStatus::ALL {
            for to in CheckoutStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for from in CheckoutStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(CheckoutStatus::ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn test_can_execute() {
        assert!(CheckoutStatus::Initiated.can_execute());
        assert!(!CheckoutStatus::ItemsReserved.can_execute());
        assert!(!CheckoutStatus::PaymentPending.can_execute());
        assert!(!CheckoutStatus::Completed.can_execute());
        assert!(!CheckoutStatus::Failed.can_execute());
        assert!(!CheckoutStatus::Expired.can_execute());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CheckoutStatus::Initiated.is_terminal());
        assert!(!CheckoutStatus::ItemsReserved.is_terminal());
        assert!(!CheckoutStatus::PaymentPending.is_terminal());
        assert!(CheckoutStatus::Completed.is_terminal());
        assert!(CheckoutStatus::Failed.is_terminal());
        assert!(CheckoutStatus::Expired.is_terminal());
    }

    #[test]
    fn test_serialization_matches_as_str() {
        for status in CheckoutStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<CheckoutStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<CheckoutStatus>().is_err());
    }
}
