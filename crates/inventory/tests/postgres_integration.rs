//! PostgreSQL integration tests for the stock store.
//!
//! These tests need Docker and share one PostgreSQL container. Run with:
//!
//! ```bash
//! cargo test -p inventory --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::CheckoutId;
use futures_util::future::join_all;
use inventory::{
    InventoryError, PostgresStockStore, ReservationLine, ReservationStatus, StockKey, StockStore,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_inventory_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresStockStore {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE stock_reservations, stock")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStockStore::new(pool)
}

fn key(sku: &str) -> StockKey {
    StockKey::new(sku, "default", "default")
}

fn line(sku: &str, quantity: i64) -> ReservationLine {
    ReservationLine {
        key: key(sku),
        quantity,
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_put_stock_upserts_and_guards_reserved() {
    let store = get_test_store().await;
    store.put_stock(&key("SKU-001"), 10, 2).await.unwrap();
    let now = Utc::now();
    store
        .reserve_batch(CheckoutId::new(), &[line("SKU-001", 6)], now + Duration::seconds(900), now)
        .await
        .unwrap();

    let stock = store.put_stock(&key("SKU-001"), 8, 3).await.unwrap();
    assert_eq!((stock.quantity, stock.reserved, stock.low_stock_threshold), (8, 6, 3));

    let err = store.put_stock(&key("SKU-001"), 5, 3).await.unwrap_err();
    assert!(matches!(err, InventoryError::BelowReserved { reserved: 6, .. }));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_batch_rolls_back_on_shortfall() {
    let store = get_test_store().await;
    store.put_stock(&key("SKU-001"), 100, 0).await.unwrap();
    store.put_stock(&key("SKU-002"), 50, 0).await.unwrap();
    let now = Utc::now();
    let checkout = CheckoutId::new();

    let err = store
        .reserve_batch(
            checkout,
            &[line("SKU-001", 5), line("SKU-002", 100)],
            now + Duration::seconds(900),
            now,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, InventoryError::InsufficientStock { .. }));
    assert_eq!(store.get_stock(&key("SKU-001")).await.unwrap().unwrap().reserved, 0);
    assert!(store.reservations_for_checkout(checkout).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_batches_do_not_oversell() {
    let store = get_test_store().await;
    store.put_stock(&key("SKU-001"), 100, 0).await.unwrap();
    let now = Utc::now();

    let tasks = (0..2).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .reserve_batch(
                    CheckoutId::new(),
                    &[line("SKU-001", 60)],
                    now + Duration::seconds(900),
                    now,
                )
                .await
        })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(store.get_stock(&key("SKU-001")).await.unwrap().unwrap().reserved, 60);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_transition_is_compare_and_set() {
    let store = get_test_store().await;
    store.put_stock(&key("SKU-001"), 10, 0).await.unwrap();
    let now = Utc::now();
    let reservation = store
        .reserve_batch(CheckoutId::new(), &[line("SKU-001", 4)], now + Duration::seconds(900), now)
        .await
        .unwrap()
        .remove(0);

    let (confirmed, stock) = store
        .transition_reservation(reservation.id, ReservationStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
    assert_eq!((stock.quantity, stock.reserved), (6, 0));

    let err = store
        .transition_reservation(reservation.id, ReservationStatus::Released)
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::InvalidTransition { .. }));
    let stock = store.get_stock(&key("SKU-001")).await.unwrap().unwrap();
    assert_eq!((stock.quantity, stock.reserved), (6, 0));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_second_active_batch_for_checkout_is_rejected() {
    let store = get_test_store().await;
    store.put_stock(&key("SKU-001"), 10, 0).await.unwrap();
    let now = Utc::now();
    let checkout = CheckoutId::new();

    store
        .reserve_batch(checkout, &[line("SKU-001", 1)], now + Duration::seconds(900), now)
        .await
        .unwrap();
    let err = store
        .reserve_batch(checkout, &[line("SKU-001", 1)], now + Duration::seconds(900), now)
        .await
        .unwrap_err();

    assert!(matches!(err, InventoryError::DuplicateReservation(_)));
    assert_eq!(store.get_stock(&key("SKU-001")).await.unwrap().unwrap().reserved, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_find_expired_reservations() {
    let store = get_test_store().await;
    store.put_stock(&key("SKU-001"), 10, 0).await.unwrap();
    let now = Utc::now();
    let old = store
        .reserve_batch(CheckoutId::new(), &[line("SKU-001", 1)], now - Duration::seconds(1), now)
        .await
        .unwrap()
        .remove(0);
    store
        .reserve_batch(CheckoutId::new(), &[line("SKU-001", 1)], now + Duration::seconds(900), now)
        .await
        .unwrap();

    let due = store.find_expired_reservations(now, 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, old.id);

    store
        .transition_reservation(old.id, ReservationStatus::Expired)
        .await
        .unwrap();
    assert!(store.find_expired_reservations(now, 10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_adjust_quantity_rejects_negative() {
    let store = get_test_store().await;
    store.put_stock(&key("SKU-001"), 3, 0).await.unwrap();

    let err = store.adjust_quantity(&key("SKU-001"), -4).await.unwrap_err();
    assert!(matches!(err, InventoryError::InvalidInput(_)));
    let stock = store.adjust_quantity(&key("SKU-001"), 7).await.unwrap();
    assert_eq!(stock.quantity, 10);
}
