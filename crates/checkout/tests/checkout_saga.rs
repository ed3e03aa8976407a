//! End-to-end saga tests against the in-memory collaborators.
//!
//! Each test wires a real reservation engine, session store, and order and
//! payment fakes into a coordinator, then checks the stock ledger and
//! collaborator state the saga leaves behind.

use std::sync::Arc;
use std::time::Duration;

use checkout::{
    CheckoutConfig, CheckoutCoordinator, CheckoutError, CheckoutStatus, Collaborators,
    ExpiryReaper, InMemoryOrderService, InventoryService, InMemoryPaymentService, InMemorySessionStore,
    NewCheckoutItem, OrderStatus, ReaperConfig, SagaStep, StartCheckout,
};
use async_trait::async_trait;
use common::{
    CheckoutId, Classify, ErrorKind, ManualClock, Money, ProductId, ReservationId, UserId,
    VariantId,
};
use events::{BroadcastPublisher, DomainEvent};
use futures_util::future::join_all;
use inventory::{
    EngineConfig, InMemoryStockStore, ReservationEngine, ReservationStatus, ReserveItem,
};
use resilience::{CircuitBreakerConfig, CircuitState};
use tokio::sync::watch;

type Engine = ReservationEngine<InMemoryStockStore>;

struct Harness {
    coordinator: Arc<CheckoutCoordinator>,
    engine: Arc<Engine>,
    sessions: Arc<InMemorySessionStore>,
    orders: InMemoryOrderService,
    payments: InMemoryPaymentService,
    clock: ManualClock,
    events: BroadcastPublisher,
}

impl Harness {
    fn new() -> Self {
        Self::build(CheckoutConfig::default(), None)
    }

    fn build(config: CheckoutConfig, shutdown: Option<watch::Receiver<bool>>) -> Self {
        Self::build_with(config, shutdown, |engine| engine)
    }

    /// Builds the harness with the engine wrapped before the coordinator sees it.
    fn build_with(
        config: CheckoutConfig,
        shutdown: Option<watch::Receiver<bool>>,
        wrap: impl FnOnce(Arc<Engine>) -> Arc<dyn InventoryService>,
    ) -> Self {
        let clock = ManualClock::default();
        let events = BroadcastPublisher::new(64);
        let engine = Arc::new(ReservationEngine::with_clock(
            InMemoryStockStore::new(),
            EngineConfig::default(),
            Arc::new(events.clone()),
            Arc::new(clock.clone()),
        ));
        let sessions = Arc::new(InMemorySessionStore::new());
        let orders = InMemoryOrderService::new();
        let payments = InMemoryPaymentService::new();

        let collaborators = Collaborators {
            sessions: sessions.clone(),
            inventory: wrap(engine.clone()),
            orders: Arc::new(orders.clone()),
            payments: Arc::new(payments.clone()),
        };
        let mut coordinator =
            CheckoutCoordinator::new(config, collaborators, Arc::new(events.clone()))
                .with_clock(Arc::new(clock.clone()));
        if let Some(rx) = shutdown {
            coordinator = coordinator.with_shutdown(rx);
        }

        Self {
            coordinator: Arc::new(coordinator),
            engine,
            sessions,
            orders,
            payments,
            clock,
            events,
        }
    }

    fn reaper(&self) -> ExpiryReaper {
        ExpiryReaper::new(
            self.coordinator.clone(),
            self.engine.clone(),
            ReaperConfig::default(),
        )
    }

    async fn seed(&self, sku: &str, quantity: i64) {
        self.engine
            .set_stock(&ProductId::new(sku), &VariantId::new("default"), quantity, 0)
            .await
            .unwrap();
    }

    async fn stock(&self, sku: &str) -> (i64, i64) {
        let stock = self
            .engine
            .get_stock(&ProductId::new(sku), &VariantId::new("default"))
            .await
            .unwrap();
        (stock.quantity, stock.reserved)
    }

    async fn wait_for_status(&self, id: CheckoutId, status: CheckoutStatus) {
        for _ in 0..500 {
            if let Ok(session) = self.coordinator.get_session(id).await
                && session.status == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("checkout {id} never reached {status}");
    }
}

/// Places holds through the engine, then stalls before answering.
struct StallingInventory {
    engine: Arc<Engine>,
    stall: Duration,
}

#[async_trait]
impl InventoryService for StallingInventory {
    async fn reserve_stock(
        &self,
        checkout_id: CheckoutId,
        items: &[ReserveItem],
        ttl_secs: u64,
    ) -> checkout::Result<Vec<ReservationId>> {
        let ids = self.engine.reserve_stock(checkout_id, items, ttl_secs).await?;
        tokio::time::sleep(self.stall).await;
        Ok(ids)
    }

    async fn release_reservation(&self, id: ReservationId) -> checkout::Result<()> {
        self.engine.release_reservation(id).await?;
        Ok(())
    }

    async fn confirm_reservation(&self, id: ReservationId) -> checkout::Result<()> {
        self.engine.confirm_reservation(id).await?;
        Ok(())
    }

    async fn active_reservations(
        &self,
        checkout_id: CheckoutId,
    ) -> checkout::Result<Vec<ReservationId>> {
        Ok(self.engine.active_reservations(checkout_id).await?)
    }
}

fn item(sku: &str, quantity: u32, unit_price: i64) -> NewCheckoutItem {
    NewCheckoutItem {
        product_id: ProductId::new(sku),
        variant_id: VariantId::new("default"),
        name: format!("Product {sku}"),
        sku: sku.to_string(),
        unit_price: Money::from_minor(unit_price),
        quantity,
    }
}

fn request(items: Vec<NewCheckoutItem>) -> StartCheckout {
    StartCheckout::new(UserId::new(), items).with_payment_method("card")
}

#[tokio::test]
async fn completed_checkout_confirms_stock_and_publishes() {
    let h = Harness::new();
    h.seed("SKU-001", 10).await;
    h.seed("SKU-002", 5).await;
    let mut events = h.events.subscribe();

    let session = h
        .coordinator
        .start_checkout(
            request(vec![item("SKU-001", 2, 1000), item("SKU-002", 1, 2500)])
                .with_shipping(Money::from_minor(500))
                .with_discount(Money::from_minor(1000)),
        )
        .await
        .unwrap();

    assert_eq!(session.status, CheckoutStatus::Completed);
    assert_eq!(session.subtotal_amount, Money::from_minor(4500));
    assert_eq!(session.total_amount, Money::from_minor(4000));
    assert!(session.order_id.is_some());
    assert!(session.payment_id.is_some());
    assert!(session.failure_reason.is_none());
    assert_eq!(session.reservation_ids().len(), 2);

    assert_eq!(h.stock("SKU-001").await, (8, 0));
    assert_eq!(h.stock("SKU-002").await, (4, 0));
    for id in session.reservation_ids() {
        let reservation = h.engine.get_reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
    }

    let payment = h.payments.payment_for_checkout(session.id).unwrap();
    assert_eq!(payment.request.amount, Money::from_minor(4000));
    assert_eq!(Some(payment.id), session.payment_id);

    let stored = h.coordinator.get_session(session.id).await.unwrap();
    assert_eq!(stored, session);

    let mut completed = None;
    while let Ok(envelope) = events.try_recv() {
        if let DomainEvent::CheckoutCompleted(data) = envelope.payload {
            completed = Some(data);
        }
    }
    let completed = completed.expect("checkout.completed published");
    assert_eq!(completed.checkout_id, session.id);
    assert_eq!(Some(completed.order_id), session.order_id);
}

#[tokio::test]
async fn insufficient_stock_fails_without_side_effects() {
    let h = Harness::new();
    h.seed("SKU-001", 1).await;

    let session = h
        .coordinator
        .start_checkout(request(vec![item("SKU-001", 3, 1000)]))
        .await
        .unwrap();

    assert_eq!(session.status, CheckoutStatus::Failed);
    let reason = session.failure_reason.as_deref().unwrap();
    assert!(reason.starts_with("reserve_stock:"), "{reason}");
    assert!(session.reservation_ids().is_empty());
    assert_eq!(h.orders.order_count(), 0);
    assert_eq!(h.payments.charge_attempts(), 0);
    assert_eq!(h.stock("SKU-001").await, (1, 0));
}

#[tokio::test]
async fn declined_payment_compensates_only_its_own_checkout() {
    let h = Harness::new();
    h.seed("SKU-001", 10).await;
    h.seed("SKU-002", 10).await;

    let bystander = CheckoutId::new();
    h.engine
        .reserve_stock(bystander, &[ReserveItem::new("SKU-001", "default", 4)], 900)
        .await
        .unwrap();

    h.payments.set_decline(true);
    let session = h
        .coordinator
        .start_checkout(request(vec![item("SKU-001", 2, 1000), item("SKU-002", 3, 500)]))
        .await
        .unwrap();

    assert_eq!(session.status, CheckoutStatus::Failed);
    let reason = session.failure_reason.as_deref().unwrap();
    assert!(reason.starts_with("charge_payment:"), "{reason}");

    let order = h.orders.order_for_checkout(session.id).unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(Some(order.id), session.order_id);

    for id in session.reservation_ids() {
        let reservation = h.engine.get_reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Released);
    }
    let held = h.engine.reservations_for_checkout(bystander).await.unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].status, ReservationStatus::Active);

    assert_eq!(h.stock("SKU-001").await, (10, 4));
    assert_eq!(h.stock("SKU-002").await, (10, 0));
}

#[tokio::test]
async fn order_failure_releases_reservations() {
    let h = Harness::new();
    h.seed("SKU-001", 10).await;
    h.orders.set_fail_on_create(true);

    let session = h
        .coordinator
        .start_checkout(request(vec![item("SKU-001", 2, 1000)]))
        .await
        .unwrap();

    assert_eq!(session.status, CheckoutStatus::Failed);
    assert!(session.order_id.is_none());
    assert!(
        session
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("create_order:")
    );
    assert_eq!(h.payments.charge_attempts(), 0);
    assert_eq!(h.stock("SKU-001").await, (10, 0));
}

#[tokio::test(start_paused = true)]
async fn slow_order_service_times_out_and_compensates() {
    let h = Harness::new();
    h.seed("SKU-001", 10).await;
    h.orders.set_create_delay(Some(Duration::from_secs(20)));

    let session = h
        .coordinator
        .start_checkout(request(vec![item("SKU-001", 1, 1000)]))
        .await
        .unwrap();

    assert_eq!(session.status, CheckoutStatus::Failed);
    let reason = session.failure_reason.as_deref().unwrap();
    assert!(reason.contains("timed out"), "{reason}");
    assert!(reason.starts_with(SagaStep::CreateOrder.as_str()));
    assert_eq!(h.stock("SKU-001").await, (10, 0));
    assert_eq!(h.payments.charge_attempts(), 0);
}

#[tokio::test]
async fn open_breaker_fails_fast_without_calling_the_service() {
    let mut config = CheckoutConfig::default();
    config.order_breaker = CircuitBreakerConfig {
        min_requests: 2,
        failure_ratio: 0.5,
        timeout: Duration::from_secs(60),
        ..CircuitBreakerConfig::named("order")
    };
    let h = Harness::build(config, None);
    h.seed("SKU-001", 100).await;
    h.orders.set_fail_on_create(true);

    for _ in 0..2 {
        let session = h
            .coordinator
            .start_checkout(request(vec![item("SKU-001", 1, 1000)]))
            .await
            .unwrap();
        assert_eq!(session.status, CheckoutStatus::Failed);
    }
    let [_, order_breaker, _] = h.coordinator.breakers();
    assert_eq!(order_breaker.state(), CircuitState::Open);

    // The service has recovered, but the breaker has not had a chance to probe it.
    h.orders.set_fail_on_create(false);
    let session = h
        .coordinator
        .start_checkout(request(vec![item("SKU-001", 1, 1000)]))
        .await
        .unwrap();

    assert_eq!(session.status, CheckoutStatus::Failed);
    let reason = session.failure_reason.as_deref().unwrap();
    assert!(reason.contains("circuit open"), "{reason}");
    assert_eq!(h.orders.order_count(), 0);
    assert_eq!(h.stock("SKU-001").await, (100, 0));
}

#[tokio::test]
async fn business_rejections_do_not_trip_the_breaker() {
    let mut config = CheckoutConfig::default();
    config.inventory_breaker = CircuitBreakerConfig {
        min_requests: 2,
        failure_ratio: 0.5,
        ..CircuitBreakerConfig::named("inventory")
    };
    let h = Harness::build(config, None);
    h.seed("SKU-001", 1).await;

    for _ in 0..5 {
        let session = h
            .coordinator
            .start_checkout(request(vec![item("SKU-001", 5, 1000)]))
            .await
            .unwrap();
        assert_eq!(session.status, CheckoutStatus::Failed);
    }
    let [inventory_breaker, _, _] = h.coordinator.breakers();
    assert_eq!(inventory_breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn abandoned_checkout_is_reclaimed_by_the_reaper() {
    let mut config = CheckoutConfig::default();
    config.timeouts.order = Duration::from_secs(60);
    let h = Harness::build(config, None);
    h.seed("SKU-001", 10).await;
    h.orders.set_create_delay(Some(Duration::from_secs(3600)));

    let request = request(vec![item("SKU-001", 3, 1000)]).with_checkout_id(CheckoutId::new());
    let id = request.checkout_id.unwrap();
    let coordinator = h.coordinator.clone();
    let in_flight = tokio::spawn(async move { coordinator.start_checkout(request).await });

    h.wait_for_status(id, CheckoutStatus::ItemsReserved).await;
    assert_eq!(h.stock("SKU-001").await, (10, 3));

    h.clock.advance(chrono::Duration::seconds(901));
    let report = h.reaper().sweep_once().await;
    in_flight.abort();

    assert_eq!(report.reservations_expired, 1);
    assert_eq!(report.sessions_expired, 1);

    let session = h.coordinator.get_session(id).await.unwrap();
    assert_eq!(session.status, CheckoutStatus::Expired);
    for rid in session.reservation_ids() {
        let reservation = h.engine.get_reservation(rid).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Expired);
    }
    assert_eq!(h.stock("SKU-001").await, (10, 0));
}

#[tokio::test]
async fn reaper_leaves_sessions_within_their_ttl() {
    let mut config = CheckoutConfig::default();
    config.timeouts.order = Duration::from_secs(60);
    let h = Harness::build(config, None);
    h.seed("SKU-001", 10).await;
    h.orders.set_create_delay(Some(Duration::from_secs(3600)));

    let request = request(vec![item("SKU-001", 1, 1000)]).with_checkout_id(CheckoutId::new());
    let id = request.checkout_id.unwrap();
    let coordinator = h.coordinator.clone();
    let in_flight = tokio::spawn(async move { coordinator.start_checkout(request).await });
    h.wait_for_status(id, CheckoutStatus::ItemsReserved).await;

    h.clock.advance(chrono::Duration::seconds(899));
    let report = h.reaper().sweep_once().await;
    in_flight.abort();

    assert_eq!(report.reservations_expired, 0);
    assert_eq!(report.sessions_expired, 0);
    let session = h.coordinator.get_session(id).await.unwrap();
    assert_eq!(session.status, CheckoutStatus::ItemsReserved);
    assert_eq!(h.stock("SKU-001").await, (10, 1));
}

#[tokio::test]
async fn shutdown_abandons_payment_and_compensates() {
    let (tx, rx) = watch::channel(false);
    let h = Harness::build(CheckoutConfig::default(), Some(rx));
    h.seed("SKU-001", 10).await;
    h.payments.set_charge_delay(Some(Duration::from_secs(3600)));

    let request = request(vec![item("SKU-001", 2, 1000)]).with_checkout_id(CheckoutId::new());
    let id = request.checkout_id.unwrap();
    let coordinator = h.coordinator.clone();
    let in_flight = tokio::spawn(async move { coordinator.start_checkout(request).await });

    h.wait_for_status(id, CheckoutStatus::PaymentPending).await;
    tx.send(true).unwrap();
    let session = in_flight.await.unwrap().unwrap();

    assert_eq!(session.status, CheckoutStatus::Failed);
    let reason = session.failure_reason.as_deref().unwrap();
    assert!(reason.contains("cancelled by shutdown"), "{reason}");
    assert_eq!(h.payments.payment_count(), 0);
    let order = h.orders.order_for_checkout(id).unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(h.stock("SKU-001").await, (10, 0));
}

#[tokio::test]
async fn settled_checkout_cannot_run_again() {
    let h = Harness::new();
    h.seed("SKU-001", 10).await;

    let request = request(vec![item("SKU-001", 1, 1000)]).with_checkout_id(CheckoutId::new());
    let session = h.coordinator.start_checkout(request.clone()).await.unwrap();
    assert_eq!(session.status, CheckoutStatus::Completed);

    let err = h.coordinator.start_checkout(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = h.coordinator.execute(session.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(h.orders.order_count(), 1);
    assert_eq!(h.payments.charge_attempts(), 1);
    assert_eq!(h.stock("SKU-001").await, (9, 0));
}

#[tokio::test]
async fn initiated_checkout_resumes() {
    let h = Harness::new();
    h.seed("SKU-001", 10).await;

    let request = request(vec![item("SKU-001", 1, 1000)]).with_checkout_id(CheckoutId::new());
    let created = h.coordinator.create_session(request.clone()).await.unwrap();
    assert_eq!(created.status, CheckoutStatus::Initiated);

    let session = h.coordinator.start_checkout(request).await.unwrap();
    assert_eq!(session.id, created.id);
    assert_eq!(session.status, CheckoutStatus::Completed);
    assert_eq!(h.sessions.session_count().await, 1);
}

#[tokio::test]
async fn overdue_initiated_checkout_expires_without_running_steps() {
    let h = Harness::new();
    h.seed("SKU-001", 10).await;
    let mut events = h.events.subscribe();

    let request = request(vec![item("SKU-001", 1, 1000)])
        .with_checkout_id(CheckoutId::new())
        .with_ttl_secs(60);
    let created = h.coordinator.create_session(request.clone()).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(120));

    let session = h.coordinator.start_checkout(request).await.unwrap();

    assert_eq!(session.id, created.id);
    assert_eq!(session.status, CheckoutStatus::Expired);
    assert_eq!(session.failure_reason.as_deref(), Some("expired while initiated"));
    assert_eq!(h.payments.charge_attempts(), 0);
    assert_eq!(h.orders.order_count(), 0);
    assert!(h.engine.reservations_for_checkout(created.id).await.unwrap().is_empty());
    assert_eq!(h.stock("SKU-001").await, (10, 0));
    let expired = std::iter::from_fn(|| events.try_recv().ok())
        .any(|envelope| matches!(envelope.payload, DomainEvent::CheckoutExpired(_)));
    assert!(expired);

    let err = h.coordinator.execute(created.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test(start_paused = true)]
async fn reserve_that_commits_after_its_timeout_is_released() {
    let h = Harness::build_with(CheckoutConfig::default(), None, |engine| {
        Arc::new(StallingInventory {
            engine,
            stall: Duration::from_secs(60),
        })
    });
    h.seed("SKU-001", 10).await;

    let session = h
        .coordinator
        .start_checkout(request(vec![item("SKU-001", 4, 1000)]))
        .await
        .unwrap();

    assert_eq!(session.status, CheckoutStatus::Failed);
    let reason = session.failure_reason.as_deref().unwrap();
    assert!(reason.starts_with(SagaStep::ReserveStock.as_str()), "{reason}");
    assert!(session.reservation_ids().is_empty());

    let holds = h.engine.reservations_for_checkout(session.id).await.unwrap();
    assert_eq!(holds.len(), 1);
    assert_eq!(holds[0].status, ReservationStatus::Released);
    assert_eq!(h.stock("SKU-001").await, (10, 0));
    assert_eq!(h.orders.order_count(), 0);
}

#[tokio::test]
async fn unknown_checkout_is_not_found() {
    let h = Harness::new();
    let err = h.coordinator.execute(CheckoutId::new()).await.unwrap_err();
    assert!(matches!(err, CheckoutError::NotFound(_)));
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_step() {
    let h = Harness::new();
    h.seed("SKU-001", 10).await;

    let invalid = [
        request(vec![]),
        request(vec![item("SKU-001", 0, 1000)]),
        request(vec![item("SKU-001", 1, 1000), item("SKU-001", 2, 1000)]),
        request(vec![item("SKU-001", 1, -5)]),
        request(vec![item("SKU-001", 1, 1000)]).with_currency("dollars"),
        request(vec![item("SKU-001", 1, 1000)]).with_ttl_secs(0),
    ];
    for request in invalid {
        let err = h.coordinator.start_checkout(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{err}");
    }
    assert_eq!(h.sessions.session_count().await, 0);
    assert_eq!(h.stock("SKU-001").await, (10, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_never_oversell() {
    let h = Harness::new();
    h.seed("SKU-001", 10).await;

    let tasks = (0..32).map(|_| {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .start_checkout(request(vec![item("SKU-001", 1, 1000)]))
                .await
        })
    });
    let sessions: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let completed = sessions
        .iter()
        .filter(|s| s.status == CheckoutStatus::Completed)
        .count();
    let failed = sessions
        .iter()
        .filter(|s| s.status == CheckoutStatus::Failed)
        .count();
    assert_eq!(completed, 10);
    assert_eq!(failed, 22);
    assert_eq!(h.payments.payment_count(), 10);
    assert_eq!(h.stock("SKU-001").await, (0, 0));
}
