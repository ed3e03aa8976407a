use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutId, ReservationId, RetryPolicy};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::error::{InventoryError, Result};
use crate::reservation::{ReservationLine, ReservationStatus, StockReservation};
use crate::stock::{Stock, StockKey};
use crate::store::StockStore;

const RESERVATION_COLUMNS: &str = "id, checkout_id, product_id, variant_id, warehouse_id, quantity, status, expires_at, created_at";

/// PostgreSQL-backed stock store.
///
/// Stock rows are locked with `SELECT ... FOR UPDATE` (in primary-key order for
/// batches) and reservation status changes are conditional updates on
/// `status = 'active'`, both inside one transaction per operation.
#[derive(Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresStockStore {
    /// Creates a new PostgreSQL stock store with the default retry policy.
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

    /// Runs the workspace's database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_stock(row: &PgRow) -> Result<Stock> {
        Ok(Stock {
            key: StockKey::new(
                row.try_get::<String, _>("product_id")?,
                row.try_get::<String, _>("variant_id")?,
                row.try_get::<String, _>("warehouse_id")?,
            ),
            quantity: row.try_get("quantity")?,
            reserved: row.try_get("reserved")?,
            low_stock_threshold: row.try_get("low_stock_threshold")?,
        })
    }

    fn row_to_reservation(row: &PgRow) -> Result<StockReservation> {
        let status: String = row.try_get("status")?;
        Ok(StockReservation {
            id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
            key: StockKey::new(
                row.try_get::<String, _>("product_id")?,
                row.try_get::<String, _>("variant_id")?,
                row.try_get::<String, _>("warehouse_id")?,
            ),
            quantity: row.try_get("quantity")?,
            checkout_id: CheckoutId::from_uuid(row.try_get::<Uuid, _>("checkout_id")?),
            status: status.parse().map_err(InventoryError::Corrupt)?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn lock_stock(tx: &mut Transaction<'_, Postgres>, key: &StockKey) -> Result<Stock> {
        let row = sqlx::query(
            r#"
            SELECT product_id, variant_id, warehouse_id, quantity, reserved, low_stock_threshold
            FROM stock
            WHERE product_id = $1 AND variant_id = $2 AND warehouse_id = $3
            FOR UPDATE
            "#,
        )
        .bind(key.product_id.as_str())
        .bind(key.variant_id.as_str())
        .bind(key.warehouse_id.as_str())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| InventoryError::StockNotFound(key.clone()))?;
        Self::row_to_stock(&row)
    }

    async fn write_counters(
        tx: &mut Transaction<'_, Postgres>,
        key: &StockKey,
        quantity: i64,
        reserved: i64,
    ) -> Result<Stock> {
        let row = sqlx::query(
            r#"
            UPDATE stock
            SET quantity = $4, reserved = $5, updated_at = now()
            WHERE product_id = $1 AND variant_id = $2 AND warehouse_id = $3
            RETURNING product_id, variant_id, warehouse_id, quantity, reserved, low_stock_threshold
            "#,
        )
        .bind(key.product_id.as_str())
        .bind(key.variant_id.as_str())
        .bind(key.warehouse_id.as_str())
        .bind(quantity)
        .bind(reserved)
        .fetch_one(&mut **tx)
        .await?;
        Self::row_to_stock(&row)
    }

    async fn reserve_batch_once(
        &self,
        checkout_id: CheckoutId,
        lines: &[ReservationLine],
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>> {
        let mut tx = self.pool.begin().await?;

        let keys: BTreeSet<&StockKey> = lines.iter().map(|l| &l.key).collect();
        let mut rows: HashMap<&StockKey, Stock> = HashMap::with_capacity(keys.len());
        for key in keys {
            let stock = Self::lock_stock(&mut tx, key).await?;
            rows.insert(key, stock);
        }

        let mut pending: HashMap<&StockKey, i64> = HashMap::new();
        for line in lines {
            let available = rows[&line.key].available() - pending.get(&line.key).copied().unwrap_or(0);
            if available < line.quantity {
                // Dropping `tx` rolls back; nothing has been written yet.
                return Err(InventoryError::InsufficientStock {
                    key: line.key.clone(),
                    requested: line.quantity,
                    available,
                });
            }
            *pending.entry(&line.key).or_insert(0) += line.quantity;
        }

        for (key, extra) in &pending {
            let stock = &rows[key];
            Self::write_counters(&mut tx, key, stock.quantity, stock.reserved + extra).await?;
        }

        let mut created = Vec::with_capacity(lines.len());
        for line in lines {
            let reservation = StockReservation {
                id: ReservationId::new(),
                key: line.key.clone(),
                quantity: line.quantity,
                checkout_id,
                status: ReservationStatus::Active,
                expires_at,
                created_at: now,
            };
            sqlx::query(
                r#"
                INSERT INTO stock_reservations
                    (id, checkout_id, product_id, variant_id, warehouse_id, quantity, status, expires_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(reservation.id.as_uuid())
            .bind(checkout_id.as_uuid())
            .bind(line.key.product_id.as_str())
            .bind(line.key.variant_id.as_str())
            .bind(line.key.warehouse_id.as_str())
            .bind(line.quantity)
            .bind(ReservationStatus::Active.as_str())
            .bind(expires_at)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("uniq_active_reservation_line")
                {
                    return InventoryError::DuplicateReservation(checkout_id);
                }
                InventoryError::Database(e)
            })?;
            created.push(reservation);
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn transition_once(
        &self,
        id: ReservationId,
        to: ReservationStatus,
    ) -> Result<(StockReservation, Stock)> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(InventoryError::ReservationNotFound(id))?;
        let mut reservation = Self::row_to_reservation(&row)?;

        if !reservation.status.can_transition_to(to) {
            return Err(InventoryError::InvalidTransition {
                id,
                status: reservation.status,
                to,
            });
        }

        let stock = Self::lock_stock(&mut tx, &reservation.key).await?;
        if stock.reserved < reservation.quantity {
            return Err(InventoryError::Corrupt(format!(
                "{} has reserved {} but reservation {} holds {}",
                stock.key, stock.reserved, id, reservation.quantity
            )));
        }

        let updated = sqlx::query(
            "UPDATE stock_reservations SET status = $2 WHERE id = $1 AND status = 'active'",
        )
        .bind(id.as_uuid())
        .bind(to.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(InventoryError::InvalidTransition {
                id,
                status: reservation.status,
                to,
            });
        }

        let quantity = if to == ReservationStatus::Confirmed {
            stock.quantity - reservation.quantity
        } else {
            stock.quantity
        };
        let stock = Self::write_counters(
            &mut tx,
            &reservation.key,
            quantity,
            stock.reserved - reservation.quantity,
        )
        .await?;

        tx.commit().await?;
        reservation.status = to;
        Ok((reservation, stock))
    }

    async fn adjust_once(&self, key: &StockKey, delta: i64) -> Result<Stock> {
        let mut tx = self.pool.begin().await?;
        let stock = Self::lock_stock(&mut tx, key).await?;

        let quantity = stock
            .quantity
            .checked_add(delta)
            .ok_or_else(|| InventoryError::InvalidInput(format!("delta {delta} overflows")))?;
        if quantity < 0 {
            return Err(InventoryError::InvalidInput(format!(
                "adjusting {key} by {delta} would make quantity negative"
            )));
        }
        if quantity < stock.reserved {
            return Err(InventoryError::BelowReserved {
                key: key.clone(),
                quantity,
                reserved: stock.reserved,
            });
        }

        let stock = Self::write_counters(&mut tx, key, quantity, stock.reserved).await?;
        tx.commit().await?;
        Ok(stock)
    }
}

#[async_trait]
impl StockStore for PostgresStockStore {
    async fn put_stock(
        &self,
        key: &StockKey,
        quantity: i64,
        low_stock_threshold: i64,
    ) -> Result<Stock> {
        let row = self
            .retry
            .run(|| async {
                sqlx::query(
                    r#"
                    INSERT INTO stock (product_id, variant_id, warehouse_id, quantity, reserved, low_stock_threshold)
                    VALUES ($1, $2, $3, $4, 0, $5)
                    ON CONFLICT (product_id, variant_id, warehouse_id) DO UPDATE
                        SET quantity = EXCLUDED.quantity,
                            low_stock_threshold = EXCLUDED.low_stock_threshold,
                            updated_at = now()
                        WHERE stock.reserved <= EXCLUDED.quantity
                    RETURNING product_id, variant_id, warehouse_id, quantity, reserved, low_stock_threshold
                    "#,
                )
                .bind(key.product_id.as_str())
                .bind(key.variant_id.as_str())
                .bind(key.warehouse_id.as_str())
                .bind(quantity)
                .bind(low_stock_threshold)
                .fetch_optional(&self.pool)
                .await
                .map_err(InventoryError::from)
            })
            .await?;

        match row {
            Some(row) => Self::row_to_stock(&row),
            None => {
                let reserved = self
                    .get_stock(key)
                    .await?
                    .map(|s| s.reserved)
                    .unwrap_or_default();
                Err(InventoryError::BelowReserved {
                    key: key.clone(),
                    quantity,
                    reserved,
                })
            }
        }
    }

    async fn get_stock(&self, key: &StockKey) -> Result<Option<Stock>> {
        let row = self
            .retry
            .run(|| async {
                sqlx::query(
                    r#"
                    SELECT product_id, variant_id, warehouse_id, quantity, reserved, low_stock_threshold
                    FROM stock
                    WHERE product_id = $1 AND variant_id = $2 AND warehouse_id = $3
                    "#,
                )
                .bind(key.product_id.as_str())
                .bind(key.variant_id.as_str())
                .bind(key.warehouse_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(InventoryError::from)
            })
            .await?;
        row.as_ref().map(Self::row_to_stock).transpose()
    }

    async fn reserve_batch(
        &self,
        checkout_id: CheckoutId,
        lines: &[ReservationLine],
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>> {
        self.retry
            .run(|| self.reserve_batch_once(checkout_id, lines, expires_at, now))
            .await
    }

    async fn transition_reservation(
        &self,
        id: ReservationId,
        to: ReservationStatus,
    ) -> Result<(StockReservation, Stock)> {
        self.retry.run(|| self.transition_once(id, to)).await
    }

    async fn adjust_quantity(&self, key: &StockKey, delta: i64) -> Result<Stock> {
        self.retry.run(|| self.adjust_once(key, delta)).await
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<StockReservation>> {
        let sql = format!("SELECT {RESERVATION_COLUMNS} FROM stock_reservations WHERE id = $1");
        let row = self
            .retry
            .run(|| async {
                sqlx::query(&sql)
                    .bind(id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(InventoryError::from)
            })
            .await?;
        row.as_ref().map(Self::row_to_reservation).transpose()
    }

    async fn reservations_for_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Vec<StockReservation>> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations WHERE checkout_id = $1 ORDER BY created_at, id"
        );
        let rows = self
            .retry
            .run(|| async {
                sqlx::query(&sql)
                    .bind(checkout_id.as_uuid())
                    .fetch_all(&self.pool)
                    .await
                    .map_err(InventoryError::from)
            })
            .await?;
        rows.iter().map(Self::row_to_reservation).collect()
    }

    async fn find_expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StockReservation>> {
        let sql = format!(
            r#"
            SELECT {RESERVATION_COLUMNS} FROM stock_reservations
            WHERE status = 'active' AND expires_at < $1
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
                    .map_err(InventoryError::from)
            })
            .await?;
        rows.iter().map(Self::row_to_reservation).collect()
    }
}
