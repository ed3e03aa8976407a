use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::CheckoutId;
use tokio::sync::RwLock;

use crate::error::{CheckoutError, Result};
use crate::session::CheckoutSession;
use crate::state::CheckoutStatus;
use crate::store::SessionStore;

/// In-memory session store.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<CheckoutId, CheckoutSession>>>,
}

impl InMemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of sessions in any status.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: &CheckoutSession) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(CheckoutError::Conflict(format!(
                "checkout session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: CheckoutId) -> Result<Option<CheckoutSession>> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn update(&self, session: &CheckoutSession, expected: CheckoutStatus) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.id) {
            Some(stored) if stored.status == expected => {
                *stored = session.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CheckoutError::NotFound(session.id)),
        }
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<CheckoutSession>> {
        let mut due: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.expires_at, s.id));
        due.truncate(limit);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use common::{Currency, Money, UserId};

    use super::*;

    fn session(expires_in: i64) -> CheckoutSession {
        let now = Utc::now();
        CheckoutSession {
            id: CheckoutId::new(),
            user_id: UserId::new(),
            status: CheckoutStatus::Initiated,
            items: vec![],
            subtotal_amount: Money::zero(),
            discount_amount: Money::zero(),
            shipping_amount: Money::zero(),
            total_amount: Money::zero(),
            currency: Currency::default(),
            shipping_address: None,
            billing_address: None,
            payment_method: None,
            payment_id: None,
            order_id: None,
            failure_reason: None,
            expires_at: now + Duration::seconds(expires_in),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = InMemorySessionStore::new();
        let s = session(900);
        store.insert(&s).await.unwrap();
        assert!(matches!(
            store.insert(&s).await.unwrap_err(),
            CheckoutError::Conflict(_)
        ));
        assert_eq!(store.get(s.id).await.unwrap(), Some(s));
    }

    #[tokio::test]
    async fn test_update_is_compare_and_set() {
        let store = InMemorySessionStore::new();
        let mut s = session(900);
        store.insert(&s).await.unwrap();

        s.status = CheckoutStatus::ItemsReserved;
        assert!(store.update(&s, CheckoutStatus::Initiated).await.unwrap());

        let mut stale = s.clone();
        stale.status = CheckoutStatus::Failed;
        assert!(!store.update(&stale, CheckoutStatus::Initiated).await.unwrap());
        assert_eq!(
            store.get(s.id).await.unwrap().unwrap().status,
            CheckoutStatus::ItemsReserved
        );
    }

    #[tokio::test]
    async fn test_update_unknown_session() {
        let store = InMemorySessionStore::new();
        let err = store
            .update(&session(900), CheckoutStatus::Initiated)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_find_expired_skips_terminal_and_live() {
        let store = InMemorySessionStore::new();
        let due = session(-10);
        let live = session(900);
        let mut done = session(-10);
        done.status = CheckoutStatus::Completed;
        for s in [&due, &live, &done] {
            store.insert(s).await.unwrap();
        }

        let found = store.find_expired(Utc::now(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }
}
