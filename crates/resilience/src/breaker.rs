//! Circuit breaker implementation.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::{BreakerError, Rejected};
use crate::state::CircuitState;

/// Request counters for the current generation.
///
/// A new generation starts on every state change and, while closed, at the
/// end of every `interval`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    /// Ratio of failures to requests in this generation.
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        f64::from(self.total_failures) / f64::from(self.requests)
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

impl Inner {
    fn current_state(&mut self, config: &CircuitBreakerConfig, now: Instant) -> (CircuitState, u64) {
        match self.state {
            CircuitState::Closed => {
                if let Some(expiry) = self.expiry
                    && expiry <= now
                {
                    self.new_generation(config, now);
                }
            }
            CircuitState::Open => {
                if let Some(expiry) = self.expiry
                    && expiry <= now
                {
                    self.set_state(config, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
        (self.state, self.generation)
    }

    fn set_state(&mut self, config: &CircuitBreakerConfig, to: CircuitState, now: Instant) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.new_generation(config, now);

        metrics::counter!(
            "circuit_breaker_state_changes_total",
            "name" => config.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
        match to {
            CircuitState::Open => {
                tracing::warn!(breaker = %config.name, %from, %to, "circuit breaker opened")
            }
            _ => tracing::info!(breaker = %config.name, %from, %to, "circuit breaker state changed"),
        }
    }

    fn new_generation(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        self.generation = self.generation.wrapping_add(1);
        self.counts = Counts::default();
        self.expiry = match self.state {
            CircuitState::Closed if config.interval.is_zero() => None,
            CircuitState::Closed => Some(now + config.interval),
            CircuitState::Open => Some(now + config.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    fn on_success(&mut self, config: &CircuitBreakerConfig, state: CircuitState, now: Instant) {
        self.counts.on_success();
        if state == CircuitState::HalfOpen
            && self.counts.consecutive_successes >= config.max_requests
        {
            self.set_state(config, CircuitState::Closed, now);
        }
    }

    fn on_failure(&mut self, config: &CircuitBreakerConfig, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => {
                self.counts.on_failure();
                if ready_to_trip(&self.counts, config) {
                    self.set_state(config, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.set_state(config, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }
}

fn ready_to_trip(counts: &Counts, config: &CircuitBreakerConfig) -> bool {
    counts.requests >= config.min_requests && counts.failure_ratio() > config.failure_ratio
}

/// Circuit breaker guarding one downstream dependency.
///
/// Cloning is cheap; all clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let mut inner = Inner {
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
        };
        inner.new_generation(&config, Instant::now());
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Returns the breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the breaker's configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state, applying any time-based transition first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        inner.current_state(&self.config, Instant::now()).0
    }

    /// Returns the counters of the current generation.
    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        inner.current_state(&self.config, Instant::now());
        inner.counts
    }

    /// Runs `call` through the breaker, counting every error as a failure.
    pub async fn call<T, E, F>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.call_with(call, |_| true).await
    }

    /// Runs `call` through the breaker.
    ///
    /// Errors for which `is_failure` returns false count as successes: the
    /// dependency answered, it just said no.
    pub async fn call_with<T, E, F, P>(&self, call: F, is_failure: P) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let generation = self.before_request()?;
        let pending = PendingCall {
            breaker: self,
            generation,
            settled: false,
        };

        let result = call.await;
        let success = match &result {
            Ok(_) => true,
            Err(e) => !is_failure(e),
        };
        pending.settle(success);

        result.map_err(BreakerError::Inner)
    }

    /// Runs `call` through the breaker, substituting `fallback` when the call is rejected.
    pub async fn call_with_fallback<T, E, F, P, FB>(
        &self,
        call: F,
        is_failure: P,
        fallback: FB,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        FB: FnOnce(Rejected) -> Result<T, E>,
    {
        match self.call_with(call, is_failure).await {
            Ok(value) => Ok(value),
            Err(BreakerError::Inner(e)) => Err(e),
            Err(BreakerError::Open(breaker)) => fallback(Rejected {
                breaker,
                state: CircuitState::Open,
            }),
            Err(BreakerError::TooManyRequests(breaker)) => fallback(Rejected {
                breaker,
                state: CircuitState::HalfOpen,
            }),
        }
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut inner = self.lock();
        let (state, generation) = inner.current_state(&self.config, Instant::now());

        let rejection = match state {
            CircuitState::Open => Some(BreakerError::Open(self.config.name.clone())),
            CircuitState::HalfOpen if inner.counts.requests >= self.config.max_requests => {
                Some(BreakerError::TooManyRequests(self.config.name.clone()))
            }
            _ => None,
        };
        if let Some(err) = rejection {
            metrics::counter!("circuit_breaker_rejections_total", "name" => self.config.name.clone())
                .increment(1);
            tracing::debug!(breaker = %self.config.name, %state, "call rejected");
            return Err(err);
        }

        inner.counts.on_request();
        Ok(generation)
    }

    fn after_request(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        let (state, current) = inner.current_state(&self.config, now);
        if generation != current {
            return;
        }
        if success {
            inner.on_success(&self.config, state, now);
        } else {
            inner.on_failure(&self.config, state, now);
        }
    }

    // Every mutation leaves `Inner` consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Records the outcome of an admitted call. A call dropped before it finished
/// (its caller was cancelled) counts as a failure so half-open probe slots are
/// never leaked.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl PendingCall<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.after_request(self.generation, success);
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.after_request(self.generation, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: "payment".to_string(),
            max_requests: 2,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_ratio: 0.5,
            min_requests: 4,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(async { Ok::<(), &'static str>(()) }).await
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..4 {
            let _ = fail(breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_min_requests() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner("boom"))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().total_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_only_when_failure_ratio_exceeded() {
        let breaker = CircuitBreaker::new(config());
        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        // 2 of 4 is exactly the threshold.
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().requests, 4);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_rejects_without_calling() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker).await;

        let attempted = AtomicU32::new(0);
        let result = breaker
            .call(async {
                attempted.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open(ref name)) if name == "payment"));
        assert_eq!(attempted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_timeout_and_closes_on_probe_successes() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker).await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts(), Counts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_caps_concurrent_probes() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let mut probes = Vec::new();
        for _ in 0..2 {
            let breaker = breaker.clone();
            let mut rx = release_rx.clone();
            probes.push(tokio::spawn(async move {
                breaker
                    .call(async move {
                        let _ = rx.wait_for(|released| *released).await;
                        Ok::<(), &'static str>(())
                    })
                    .await
            }));
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let extra = succeed(&breaker).await;
        assert!(matches!(extra, Err(BreakerError::TooManyRequests(_))));

        release_tx.send(true).unwrap();
        for probe in probes {
            probe.await.unwrap().unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_resets_closed_counts() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = fail(&breaker).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_failures_do_not_trip() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..10 {
            let result = breaker
                .call_with(async { Err::<(), _>("out of stock") }, |_| false)
                .await;
            assert!(matches!(result, Err(BreakerError::Inner("out of stock"))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().total_successes, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_runs_only_when_rejected() {
        let breaker = CircuitBreaker::new(config());

        let passthrough = breaker
            .call_with_fallback(async { Err::<u32, _>("boom".to_string()) }, |_| true, |_| Ok(0))
            .await;
        assert_eq!(passthrough.unwrap_err(), "boom");

        trip(&breaker).await;
        let degraded = breaker
            .call_with_fallback(
                async { Ok::<u32, String>(1) },
                |_| true,
                |rejected| Err(format!("{} degraded ({})", rejected.breaker, rejected.state)),
            )
            .await;
        assert_eq!(degraded.unwrap_err(), "payment degraded (open)");
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_call_counts_as_failure() {
        let breaker = CircuitBreaker::new(config());
        let call = breaker.call(std::future::pending::<Result<(), &'static str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert!(timed_out.is_err());
        assert_eq!(breaker.counts().total_failures, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_are_all_counted() {
        let mut config = config();
        config.min_requests = 1000;
        let breaker = CircuitBreaker::new(config);

        let tasks: Vec<_> = (0..200)
            .map(|i| {
                let breaker = breaker.clone();
                tokio::spawn(async move {
                    breaker
                        .call(async move { if i % 2 == 0 { Ok(()) } else { Err("boom") } })
                        .await
                })
            })
            .collect();
        for result in futures_util::future::join_all(tasks).await {
            let _ = result.unwrap();
        }

        let counts = breaker.counts();
        assert_eq!(counts.requests, 200);
        assert_eq!(counts.total_successes, 100);
        assert_eq!(counts.total_failures, 100);
    }
}
