//! Stock reservations (TTL-bounded holds).

use chrono::{DateTime, Utc};
use common::{CheckoutId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::stock::StockKey;

/// The state of a reservation.
///
/// State transitions:
/// ```text
///          ┌──► Confirmed
/// Active ──┼──► Released
///          └──► Expired
/// ```
/// Every non-active state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Stock is held.
    Active,
    /// The hold became a permanent deduction (terminal state).
    Confirmed,
    /// The hold was given back by compensation (terminal state).
    Released,
    /// The TTL elapsed and the reaper gave the hold back (terminal state).
    Expired,
}

impl ReservationStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }

    /// Returns true if `self -> to` is a valid transition.
    pub fn can_transition_to(&self, to: ReservationStatus) -> bool {
        matches!(self, ReservationStatus::Active) && to.is_terminal()
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReservationStatus::Active),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "released" => Ok(ReservationStatus::Released),
            "expired" => Ok(ReservationStatus::Expired),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// A hold on stock for one checkout line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservation {
    pub id: ReservationId,
    pub key: StockKey,
    pub quantity: i64,
    /// Logical link to the checkout session; not enforced across the service boundary.
    pub checkout_id: CheckoutId,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl StockReservation {
    /// Returns true if the hold is active and its TTL has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at < now
    }
}

/// One line of a batch reservation request, resolved to a stock row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationLine {
    pub key: StockKey,
    pub quantity: i64,
}
