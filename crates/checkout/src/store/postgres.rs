use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutId, Currency, Money, OrderId, PaymentId, RetryPolicy, UserId};
use sqlx::types::Json;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::error::{CheckoutError, Result};
use crate::session::{Address, CheckoutItem, CheckoutSession};
use crate::state::CheckoutStatus;
use crate::store::SessionStore;

const SESSION_COLUMNS: &str = "id, user_id, status, items, subtotal_amount, discount_amount, \
     shipping_amount, total_amount, currency, shipping_address, billing_address, payment_method, \
     payment_id, order_id, failure_reason, expires_at, created_at, updated_at";

/// PostgreSQL-backed session store.
#[derive(Clone)]
pub struct PostgresSessionStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresSessionStore {
    /// Creates a new PostgreSQL session store with the default retry policy.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    /// Overrides the retry policy used for transient connection failures.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_session(row: &PgRow) -> Result<CheckoutSession> {
        let status: String = row.try_get("status")?;
        let currency: String = row.try_get("currency")?;
        let Json(items): Json<Vec<CheckoutItem>> = row.try_get("items")?;
        let shipping_address: Option<Json<Address>> = row.try_get("shipping_address")?;
        let billing_address: Option<Json<Address>> = row.try_get("billing_address")?;

        Ok(CheckoutSession {
            id: CheckoutId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            status: status.parse().map_err(decode_error)?,
            items,
            subtotal_amount: Money::from_minor(row.try_get("subtotal_amount")?),
            discount_amount: Money::from_minor(row.try_get("discount_amount")?),
            shipping_amount: Money::from_minor(row.try_get("shipping_amount")?),
            total_amount: Money::from_minor(row.try_get("total_amount")?),
            currency: Currency::parse(&currency).map_err(|e| decode_error(e.to_string()))?,
            shipping_address: shipping_address.map(|Json(a)| a),
            billing_address: billing_address.map(|Json(a)| a),
            payment_method: row.try_get("payment_method")?,
            payment_id: row
                .try_get::<Option<Uuid>, _>("payment_id")?
                .map(PaymentId::from_uuid),
            order_id: row
                .try_get::<Option<Uuid>, _>("order_id")?
                .map(OrderId::from_uuid),
            failure_reason: row.try_get("failure_reason")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn decode_error(message: String) -> CheckoutError {
    CheckoutError::Database(sqlx::Error::Decode(message.into()))
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn insert(&self, session: &CheckoutSession) -> Result<()> {
        let result = self
            .retry
            .run(|| async {
                sqlx::query(
                    r#"
                    INSERT INTO checkout_sessions
                        (id, user_id, status, items, subtotal_amount, discount_amount, shipping_amount,
                         total_amount, currency, shipping_address, billing_address, payment_method,
                         payment_id, order_id, failure_reason, expires_at, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(session.id.as_uuid())
                .bind(session.user_id.as_uuid())
                .bind(session.status.as_str())
                .bind(Json(&session.items))
                .bind(session.subtotal_amount.minor())
                .bind(session.discount_amount.minor())
                .bind(session.shipping_amount.minor())
                .bind(session.total_amount.minor())
                .bind(session.currency.as_str())
                .bind(session.shipping_address.as_ref().map(Json))
                .bind(session.billing_address.as_ref().map(Json))
                .bind(session.payment_method.as_deref())
                .bind(session.payment_id.map(|id| id.as_uuid()))
                .bind(session.order_id.map(|id| id.as_uuid()))
                .bind(session.failure_reason.as_deref())
                .bind(session.expires_at)
                .bind(session.created_at)
                .bind(session.updated_at)
                .execute(&self.pool)
                .await
                .map_err(CheckoutError::from)
            })
            .await?;

        if result.rows_affected() == 0 {
            return Err(CheckoutError::Conflict(format!(
                "checkout session {} already exists",
                session.id
            )));
        }
        Ok(())
    }

    async fn get(&self, id: CheckoutId) -> Result<Option<CheckoutSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE id = $1");
        let row = self
            .retry
            .run(|| async {
                sqlx::query(&sql)
                    .bind(id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(CheckoutError::from)
            })
            .await?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn update(&self, session: &CheckoutSession, expected: CheckoutStatus) -> Result<bool> {
        let result = self
            .retry
            .run(|| async {
                sqlx::query(
                    r#"
                    UPDATE checkout_sessions
                    SET status = $3, items = $4, payment_method = $5, payment_id = $6,
                        order_id = $7, failure_reason = $8, updated_at = $9
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(session.id.as_uuid())
                .bind(expected.as_str())
                .bind(session.status.as_str())
                .bind(Json(&session.items))
                .bind(session.payment_method.as_deref())
                .bind(session.payment_id.map(|id| id.as_uuid()))
                .bind(session.order_id.map(|id| id.as_uuid()))
                .bind(session.failure_reason.as_deref())
                .bind(session.updated_at)
                .execute(&self.pool)
                .await
                .map_err(CheckoutError::from)
            })
            .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(session.id).await? {
            Some(_) => Ok(false),
            None => Err(CheckoutError::NotFound(session.id)),
        }
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<CheckoutSession>> {
        let sql = format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM checkout_sessions
            WHERE status IN ('initiated', 'items_reserved', 'payment_pending') AND expires_at < $1
            ORDER BY expires_at, id
            LIMIT $2
            "#
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .retry
            .run(|| async {
                sqlx::query(&sql)
                    .bind(now)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(CheckoutError::from)
            })
            .await?;
        rows.iter().map(Self::row_to_session).collect()
    }
}
