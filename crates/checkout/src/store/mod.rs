//! Persistence for checkout sessions.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::CheckoutId;

use crate::error::Result;
use crate::session::CheckoutSession;
use crate::state::CheckoutStatus;

pub use memory::InMemorySessionStore;
pub use postgres::PostgresSessionStore;

/// Stores checkout sessions.
///
/// `update` is a compare-and-set on `status`: it is the only mechanism that
/// keeps the coordinator and the reaper from both acting on one session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a new session. Fails with `Conflict` if the ID is taken.
    async fn insert(&self, session: &CheckoutSession) -> Result<()>;

    /// Loads a session.
    async fn get(&self, id: CheckoutId) -> Result<Option<CheckoutSession>>;

    /// Overwrites the session if its stored status still equals `expected`.
    ///
    /// Returns false, writing nothing, when another writer moved it first.
    async fn update(&self, session: &CheckoutSession, expected: CheckoutStatus) -> Result<bool>;

    /// Lists non-terminal sessions whose deadline passed before `now`, oldest first.
    async fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<CheckoutSession>>;
}
