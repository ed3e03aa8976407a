//! Periodic expiry of stale reservations and checkout sessions.

use std::sync::Arc;

use async_trait::async_trait;
use inventory::{ReservationEngine, StockStore};
use tokio::sync::watch;

use crate::config::ReaperConfig;
use crate::coordinator::CheckoutCoordinator;
use crate::error::Result;

/// Expires reservations whose TTL has passed.
#[async_trait]
pub trait ReservationSweeper: Send + Sync {
    /// Expires up to `limit` reservations and returns how many were expired.
    async fn expire_due(&self, limit: usize) -> Result<usize>;
}

#[async_trait]
impl<S: StockStore + 'static> ReservationSweeper for ReservationEngine<S> {
    async fn expire_due(&self, limit: usize) -> Result<usize> {
        Ok(ReservationEngine::expire_due(self, limit).await?)
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperReport {
    pub reservations_expired: usize,
    pub sessions_expired: usize,
}

/// Background job that reclaims stock held by abandoned checkouts.
///
/// Reservations are swept before sessions, so a session expiring in the same
/// pass finds its holds already settled and its compensation is a no-op.
pub struct ExpiryReaper {
    coordinator: Arc<CheckoutCoordinator>,
    reservations: Arc<dyn ReservationSweeper>,
    config: ReaperConfig,
}

impl ExpiryReaper {
    pub fn new(
        coordinator: Arc<CheckoutCoordinator>,
        reservations: Arc<dyn ReservationSweeper>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            coordinator,
            reservations,
            config,
        }
    }

    /// Runs one sweep over both tables.
    ///
    /// A failure on one table does not stop the other from being swept.
    pub async fn sweep_once(&self) -> ReaperReport {
        let mut report = ReaperReport::default();

        match self.reservations.expire_due(self.config.batch_size).await {
            Ok(n) => report.reservations_expired = n,
            Err(e) => tracing::warn!(error = %e, "reservation sweep failed"),
        }
        match self
            .coordinator
            .expire_due_sessions(self.config.batch_size)
            .await
        {
            Ok(n) => report.sessions_expired = n,
            Err(e) => tracing::warn!(error = %e, "session sweep failed"),
        }

        metrics::counter!("reaper_reservations_expired_total")
            .increment(report.reservations_expired as u64);
        metrics::counter!("reaper_sessions_expired_total").increment(report.sessions_expired as u64);
        if report != ReaperReport::default() {
            tracing::info!(
                reservations = report.reservations_expired,
                sessions = report.sessions_expired,
                "reaper sweep expired stale holds"
            );
        }
        report
    }

    /// Sweeps on a fixed interval until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.config.interval, batch_size = self.config.batch_size, "reaper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reaper stopped");
    }
}
