//! Checkout saga coordinator.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::{CheckoutId, Classify, Clock, Currency, ErrorKind, ReservationId, SystemClock};
use events::{
    CheckoutCompletedData, CheckoutExpiredData, CheckoutFailedData, DomainEvent, SharedPublisher,
};
use inventory::ReserveItem;
use resilience::CircuitBreaker;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::CheckoutConfig;
use crate::error::{CheckoutError, Result};
use crate::services::{ChargeRequest, InventoryService, OrderRequest, OrderService, PaymentService};
use crate::session::{CheckoutItem, CheckoutSession, StartCheckout, Totals};
use crate::state::CheckoutStatus;
use crate::steps::SagaStep;
use crate::store::SessionStore;

/// The stores and downstream services a coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionStore>,
    pub inventory: Arc<dyn InventoryService>,
    pub orders: Arc<dyn OrderService>,
    pub payments: Arc<dyn PaymentService>,
}

/// Outcome of a compare-and-set on the session status.
enum Progress {
    Applied,
    /// Another writer moved the session first; holds the stored copy.
    Lost(CheckoutSession),
}

/// Drives checkout sessions through reserve stock → create order → charge payment.
///
/// Every committed side effect is recorded on the session before the next
/// step starts, so a failure compensates exactly the steps that succeeded, in
/// reverse order. Each collaborator sits behind its own circuit breaker, shared
/// by every saga this coordinator runs.
pub struct CheckoutCoordinator {
    sessions: Arc<dyn SessionStore>,
    inventory: Arc<dyn InventoryService>,
    orders: Arc<dyn OrderService>,
    payments: Arc<dyn PaymentService>,
    inventory_breaker: CircuitBreaker,
    order_breaker: CircuitBreaker,
    payment_breaker: CircuitBreaker,
    config: CheckoutConfig,
    clock: Arc<dyn Clock>,
    publisher: SharedPublisher,
    shutdown: Option<watch::Receiver<bool>>,
}

impl CheckoutCoordinator {
    /// Creates a coordinator backed by the system clock.
    pub fn new(
        config: CheckoutConfig,
        collaborators: Collaborators,
        publisher: SharedPublisher,
    ) -> Self {
        Self {
            sessions: collaborators.sessions,
            inventory: collaborators.inventory,
            orders: collaborators.orders,
            payments: collaborators.payments,
            inventory_breaker: CircuitBreaker::new(config.inventory_breaker.clone()),
            order_breaker: CircuitBreaker::new(config.order_breaker.clone()),
            payment_breaker: CircuitBreaker::new(config.payment_breaker.clone()),
            config,
            clock: Arc::new(SystemClock),
            publisher,
            shutdown: None,
        }
    }

    /// Replaces the clock used for session deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Abandons in-flight steps once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    /// Returns the inventory, order and payment breakers, in that order.
    pub fn breakers(&self) -> [&CircuitBreaker; 3] {
        [
            &self.inventory_breaker,
            &self.order_breaker,
            &self.payment_breaker,
        ]
    }

    /// Loads a session.
    pub async fn get_session(&self, id: CheckoutId) -> Result<CheckoutSession> {
        self.sessions
            .get(id)
            .await?
            .ok_or(CheckoutError::NotFound(id))
    }

    /// Validates the request and runs the saga to a terminal status.
    ///
    /// A request carrying the ID of an `initiated` session resumes it; any
    /// other existing status is a conflict. Step failures do not surface as
    /// errors: the returned session is `failed` with a `failure_reason`.
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn start_checkout(&self, request: StartCheckout) -> Result<CheckoutSession> {
        if let Some(id) = request.checkout_id
            && let Some(existing) = self.sessions.get(id).await?
        {
            if !existing.status.can_execute() {
                return Err(CheckoutError::Conflict(format!(
                    "checkout {id} is already {}",
                    existing.status
                )));
            }
            tracing::info!(checkout_id = %id, "resuming checkout");
            return self.execute(id).await;
        }

        let session = self.create_session(request).await?;
        self.execute(session.id).await
    }

    /// Validates the request, computes totals and persists an `initiated` session.
    pub async fn create_session(&self, request: StartCheckout) -> Result<CheckoutSession> {
        if request.items.is_empty() {
            return Err(CheckoutError::Validation("items must not be empty".into()));
        }
        let mut lines = HashSet::with_capacity(request.items.len());
        for item in &request.items {
            if item.quantity == 0 {
                return Err(CheckoutError::Validation(format!(
                    "quantity for {} must be positive",
                    item.sku
                )));
            }
            if item.product_id.as_str().is_empty() || item.variant_id.as_str().is_empty() {
                return Err(CheckoutError::Validation(format!(
                    "item {} must name a product and variant",
                    item.sku
                )));
            }
            if !lines.insert((item.product_id.clone(), item.variant_id.clone())) {
                return Err(CheckoutError::Validation(format!(
                    "duplicate line for {}/{}",
                    item.product_id, item.variant_id
                )));
            }
        }
        let currency =
            Currency::parse(&request.currency).map_err(|e| CheckoutError::Validation(e.to_string()))?;

        let ttl_secs = request
            .ttl_secs
            .unwrap_or_else(|| self.config.default_ttl.as_secs());
        let ttl = i64::try_from(ttl_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| CheckoutError::Validation(format!("ttl {ttl_secs}s is out of range")))?;

        let items: Vec<CheckoutItem> = request.items.into_iter().map(Into::into).collect();
        let totals = Totals::compute(&items, request.discount_amount, request.shipping_amount)
            .map_err(CheckoutError::Validation)?;

        let now = self.clock.now();
        let session = CheckoutSession {
            id: request.checkout_id.unwrap_or_default(),
            user_id: request.user_id,
            status: CheckoutStatus::Initiated,
            items,
            subtotal_amount: totals.subtotal,
            discount_amount: totals.discount,
            shipping_amount: totals.shipping,
            total_amount: totals.total,
            currency,
            shipping_address: request.shipping_address,
            billing_address: request.billing_address,
            payment_method: request.payment_method,
            payment_id: None,
            order_id: None,
            failure_reason: None,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        };

        self.sessions.insert(&session).await?;
        tracing::info!(checkout_id = %session.id, total = %session.total_amount, "checkout session created");
        Ok(session)
    }

    /// Runs the saga for an `initiated` session under the overall deadline.
    #[tracing::instrument(skip(self))]
    pub async fn execute(&self, id: CheckoutId) -> Result<CheckoutSession> {
        let session = self.get_session(id).await?;
        if !session.status.can_execute() {
            return Err(CheckoutError::Conflict(format!(
                "checkout {id} is already {}",
                session.status
            )));
        }

        if session.expires_at <= self.clock.now() {
            tracing::warn!(checkout_id = %id, expires_at = %session.expires_at, "checkout deadline passed before the saga ran");
            self.expire_session(session).await?;
            return self.get_session(id).await;
        }

        metrics::counter!("checkout_started_total").increment(1);
        let started = std::time::Instant::now();
        let deadline = Instant::now() + self.config.timeouts.total();

        let result = self.run(session, deadline).await;

        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn run(&self, mut session: CheckoutSession, deadline: Instant) -> Result<CheckoutSession> {
        // Step 1: reserve stock. Nothing to compensate if it fails.
        let items: Vec<ReserveItem> = session
            .items
            .iter()
            .map(|i| ReserveItem {
                product_id: i.product_id.clone(),
                variant_id: i.variant_id.clone(),
                quantity: i64::from(i.quantity),
            })
            .collect();
        // Holds expire with the session, rounded up to whole seconds.
        let remaining_ms = (session.expires_at - self.clock.now()).num_milliseconds();
        let ttl_secs = u64::try_from(remaining_ms).unwrap_or(0).div_ceil(1000).max(1);

        tracing::info!(step = %SagaStep::ReserveStock, "saga step started");
        let reserved = self
            .call_step(
                SagaStep::ReserveStock,
                &self.inventory_breaker,
                budget(self.config.timeouts.inventory, deadline),
                self.inventory.reserve_stock(session.id, &items, ttl_secs),
            )
            .await;
        let reservation_ids = match reserved {
            Ok(ids) => ids,
            Err(e) => return self.fail(session, SagaStep::ReserveStock, e).await,
        };
        if reservation_ids.len() != session.items.len() {
            let error = CheckoutError::downstream(
                "inventory",
                ErrorKind::Internal,
                format!(
                    "expected {} reservations, got {}",
                    session.items.len(),
                    reservation_ids.len()
                ),
            );
            self.release_all(session.id, &reservation_ids).await;
            return self.fail(session, SagaStep::ReserveStock, error).await;
        }
        for (item, id) in session.items.iter_mut().zip(reservation_ids) {
            item.reservation_id = Some(id);
        }
        if let Some(stored) = self
            .progress(&mut session, CheckoutStatus::ItemsReserved)
            .await?
        {
            return Ok(stored);
        }

        // Step 2: create the order.
        tracing::info!(step = %SagaStep::CreateOrder, "saga step started");
        let created = self
            .call_step(
                SagaStep::CreateOrder,
                &self.order_breaker,
                budget(self.config.timeouts.order, deadline),
                self.orders.create_order(session.id, OrderRequest::from(&session)),
            )
            .await;
        let order_id = match created {
            Ok(id) => id,
            Err(e) => return self.fail(session, SagaStep::CreateOrder, e).await,
        };
        session.order_id = Some(order_id);
        if let Some(stored) = self
            .progress(&mut session, CheckoutStatus::PaymentPending)
            .await?
        {
            return Ok(stored);
        }

        // Step 3: charge. Once this succeeds there is no going back.
        tracing::info!(step = %SagaStep::ChargePayment, "saga step started");
        let charge = ChargeRequest {
            idempotency_key: session.id,
            order_id,
            amount: session.total_amount,
            currency: session.currency.clone(),
            method: session.payment_method.clone(),
        };
        let charged = self
            .call_step(
                SagaStep::ChargePayment,
                &self.payment_breaker,
                budget(self.config.timeouts.payment, deadline),
                self.payments.charge(charge),
            )
            .await;
        let payment_id = match charged {
            Ok(id) => id,
            Err(e) => return self.fail(session, SagaStep::ChargePayment, e).await,
        };
        session.payment_id = Some(payment_id);

        self.confirm_all(&session).await;

        match self.transition(&mut session, CheckoutStatus::Completed).await {
            Ok(Progress::Applied) => {}
            Ok(Progress::Lost(stored)) => {
                tracing::error!(
                    checkout_id = %session.id,
                    %payment_id,
                    status = %stored.status,
                    "payment captured for a checkout that was closed concurrently"
                );
                return Ok(stored);
            }
            Err(e) => {
                tracing::error!(checkout_id = %session.id, %payment_id, error = %e, "failed to record completed checkout");
                return Err(e);
            }
        }

        metrics::counter!("checkout_completed_total").increment(1);
        tracing::info!(checkout_id = %session.id, %order_id, %payment_id, "checkout completed");
        self.publisher
            .publish(DomainEvent::CheckoutCompleted(CheckoutCompletedData {
                checkout_id: session.id,
                user_id: session.user_id,
                order_id,
                payment_id,
                total_amount: session.total_amount,
                currency: session.currency.clone(),
                completed_at: session.updated_at,
            }));
        Ok(session)
    }

    /// Persists a forward transition after a step committed.
    ///
    /// Returns the stored session when the saga must stop: another writer
    /// got there first. If that writer closed the session, the side effect
    /// just committed is compensated here since it could not have seen it.
    async fn progress(
        &self,
        session: &mut CheckoutSession,
        to: CheckoutStatus,
    ) -> Result<Option<CheckoutSession>> {
        match self.transition(session, to).await {
            Ok(Progress::Applied) => Ok(None),
            Ok(Progress::Lost(stored)) => {
                if stored.status.is_terminal() {
                    self.compensate(session).await;
                }
                Ok(Some(stored))
            }
            Err(e) => {
                tracing::error!(checkout_id = %session.id, %to, error = %e, "failed to persist saga progress");
                self.compensate(session).await;
                Err(e)
            }
        }
    }

    /// Compare-and-set from the session's current status to `to`.
    async fn transition(
        &self,
        session: &mut CheckoutSession,
        to: CheckoutStatus,
    ) -> Result<Progress> {
        let from = session.status;
        if !from.can_transition_to(to) {
            return Err(CheckoutError::InvalidTransition { from, to });
        }

        session.status = to;
        session.updated_at = self.clock.now();
        if self.sessions.update(session, from).await? {
            tracing::debug!(checkout_id = %session.id, %from, %to, "session transitioned");
            return Ok(Progress::Applied);
        }

        session.status = from;
        let stored = self.get_session(session.id).await?;
        tracing::warn!(
            checkout_id = %session.id,
            %from,
            %to,
            actual = %stored.status,
            "session moved concurrently"
        );
        Ok(Progress::Lost(stored))
    }

    /// Compensates, marks the session failed and publishes `checkout.failed`.
    async fn fail(
        &self,
        mut session: CheckoutSession,
        step: SagaStep,
        error: CheckoutError,
    ) -> Result<CheckoutSession> {
        metrics::counter!("saga_step_failures_total", "step" => step.as_str()).increment(1);
        tracing::warn!(checkout_id = %session.id, %step, kind = %error.kind(), error = %error, "saga step failed");

        let reason = format!("{step}: {error}");
        session.failure_reason = Some(reason.clone());
        // A reserve that timed out or was abandoned may still have committed.
        let unrecorded = step == SagaStep::ReserveStock
            && (error.is_dependency_failure() || matches!(error, CheckoutError::Cancelled { .. }));
        let compensation = async {
            if unrecorded {
                self.release_unrecorded(session.id).await;
            }
            self.compensate(&session).await;
        };
        if matches!(error, CheckoutError::Cancelled { .. }) {
            let grace = self.config.compensation_grace;
            if tokio::time::timeout(grace, compensation).await.is_err() {
                metrics::counter!("compensation_failures_total", "step" => "grace_exceeded")
                    .increment(1);
                tracing::error!(checkout_id = %session.id, ?grace, "compensation exceeded its grace period");
            }
        } else {
            compensation.await;
        }

        match self.transition(&mut session, CheckoutStatus::Failed).await? {
            Progress::Applied => {}
            Progress::Lost(stored) => return Ok(stored),
        }

        metrics::counter!("checkout_failed_total").increment(1);
        self.publisher
            .publish(DomainEvent::CheckoutFailed(CheckoutFailedData {
                checkout_id: session.id,
                user_id: session.user_id,
                step: step.as_str().to_string(),
                reason,
                failed_at: session.updated_at,
            }));
        Ok(session)
    }

    /// Expires an open session and compensates whatever it committed.
    ///
    /// Returns false if the session settled before the reaper got to it.
    #[tracing::instrument(skip(self, session), fields(checkout_id = %session.id))]
    pub async fn expire_session(&self, mut session: CheckoutSession) -> Result<bool> {
        let previous = session.status;
        session.failure_reason = Some(format!("expired while {previous}"));
        match self.transition(&mut session, CheckoutStatus::Expired).await? {
            Progress::Applied => {}
            Progress::Lost(_) => return Ok(false),
        }

        if previous == CheckoutStatus::Initiated {
            self.release_unrecorded(session.id).await;
        }
        self.compensate(&session).await;

        metrics::counter!("checkout_expired_total").increment(1);
        tracing::info!(%previous, "checkout expired");
        self.publisher
            .publish(DomainEvent::CheckoutExpired(CheckoutExpiredData {
                checkout_id: session.id,
                user_id: session.user_id,
                previous_status: previous.as_str().to_string(),
                expired_at: session.updated_at,
            }));
        Ok(true)
    }

    /// Expires up to `limit` open sessions past their deadline.
    pub async fn expire_due_sessions(&self, limit: usize) -> Result<usize> {
        let due = self.sessions.find_expired(self.clock.now(), limit).await?;
        let mut expired = 0;
        for session in due {
            let id = session.id;
            match self.expire_session(session).await {
                Ok(true) => expired += 1,
                Ok(false) => tracing::debug!(checkout_id = %id, "session settled before expiry"),
                Err(e) => tracing::warn!(checkout_id = %id, error = %e, "failed to expire session"),
            }
        }
        Ok(expired)
    }

    /// Undoes committed steps in reverse order: cancel the order, then
    /// release holds last-to-first. Failures are logged, never raised.
    async fn compensate(&self, session: &CheckoutSession) {
        if let Some(order_id) = session.order_id {
            let reason = session
                .failure_reason
                .clone()
                .unwrap_or_else(|| format!("checkout {} did not complete", session.id));
            let result = self
                .call_step(
                    SagaStep::CancelOrder,
                    &self.order_breaker,
                    self.config.timeouts.order,
                    self.orders.cancel_order(order_id, &reason),
                )
                .await;
            log_compensation(SagaStep::CancelOrder, session.id, result);
        }

        let mut holds = session.reservation_ids();
        holds.reverse();
        self.release_all(session.id, &holds).await;
    }

    /// Releases holds the inventory placed for a checkout whose IDs never
    /// made it onto the session.
    async fn release_unrecorded(&self, checkout_id: CheckoutId) {
        let found = self
            .call_step(
                SagaStep::ReleaseReservations,
                &self.inventory_breaker,
                self.config.timeouts.inventory,
                self.inventory.active_reservations(checkout_id),
            )
            .await;
        match found {
            Ok(mut ids) if !ids.is_empty() => {
                tracing::info!(%checkout_id, count = ids.len(), "releasing unrecorded reservations");
                ids.reverse();
                self.release_all(checkout_id, &ids).await;
            }
            Ok(_) => {}
            Err(e) => log_compensation(SagaStep::ReleaseReservations, checkout_id, Err(e)),
        }
    }

    async fn release_all(&self, checkout_id: CheckoutId, ids: &[ReservationId]) {
        for id in ids {
            let result = self
                .call_step(
                    SagaStep::ReleaseReservations,
                    &self.inventory_breaker,
                    self.config.timeouts.inventory,
                    self.inventory.release_reservation(*id),
                )
                .await;
            log_compensation(SagaStep::ReleaseReservations, checkout_id, result);
        }
    }

    /// Confirms every hold after payment. A failure here is logged and the
    /// checkout still completes; the hold is reclaimed by the reaper.
    async fn confirm_all(&self, session: &CheckoutSession) {
        for id in session.reservation_ids() {
            let result = self
                .call_step(
                    SagaStep::ConfirmReservations,
                    &self.inventory_breaker,
                    self.config.timeouts.inventory,
                    self.inventory.confirm_reservation(id),
                )
                .await;
            if let Err(e) = result {
                metrics::counter!("saga_step_failures_total", "step" => SagaStep::ConfirmReservations.as_str())
                    .increment(1);
                tracing::error!(checkout_id = %session.id, reservation_id = %id, error = %e, "failed to confirm reservation after payment");
            }
        }
    }

    /// Runs one collaborator call through its breaker and time budget.
    ///
    /// A rejected call fails fast with `CircuitOpen` without spending the
    /// budget. Forward steps are also abandoned when shutdown is signalled.
    async fn call_step<T, F>(
        &self,
        step: SagaStep,
        breaker: &CircuitBreaker,
        budget: Duration,
        call: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let shutdown = if step.observes_shutdown() {
            self.shutdown.clone()
        } else {
            None
        };
        let bounded = async {
            tokio::select! {
                outcome = tokio::time::timeout(budget, call) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(CheckoutError::Timeout { step }),
                },
                _ = shutdown_signalled(shutdown) => Err(CheckoutError::Cancelled { step }),
            }
        };

        breaker
            .call_with_fallback(bounded, CheckoutError::is_dependency_failure, |rejected| {
                tracing::warn!(%step, breaker = %rejected.breaker, state = %rejected.state, "step short-circuited");
                Err(CheckoutError::CircuitOpen {
                    service: rejected.breaker,
                })
            })
            .await
    }
}

/// Remaining time for a step: its own timeout, capped by the saga deadline.
fn budget(step_timeout: Duration, deadline: Instant) -> Duration {
    step_timeout.min(deadline.saturating_duration_since(Instant::now()))
}

async fn shutdown_signalled(shutdown: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = shutdown
        && rx.wait_for(|stop| *stop).await.is_ok()
    {
        return;
    }
    // No shutdown channel, or its sender is gone without signalling.
    std::future::pending::<()>().await
}

fn log_compensation(step: SagaStep, checkout_id: CheckoutId, result: Result<()>) {
    match result {
        Ok(()) => tracing::debug!(%checkout_id, %step, "compensation step completed"),
        // Already settled elsewhere, typically expired by the reaper.
        Err(e) if e.kind() == ErrorKind::Conflict => {
            tracing::debug!(%checkout_id, %step, error = %e, "nothing to compensate");
        }
        Err(e) => {
            metrics::counter!("compensation_failures_total", "step" => step.as_str()).increment(1);
            tracing::warn!(%checkout_id, %step, error = %e, "compensation step failed; the reaper will reclaim it");
        }
    }
}
