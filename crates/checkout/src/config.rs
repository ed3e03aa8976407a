//! Checkout coordinator and reaper configuration.

use std::time::Duration;

use resilience::CircuitBreakerConfig;

/// Per-step time budgets. Their sum is the deadline for a whole saga run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SagaTimeouts {
    pub inventory: Duration,
    pub order: Duration,
    pub payment: Duration,
}

impl SagaTimeouts {
    /// Returns the overall saga deadline.
    pub fn total(&self) -> Duration {
        self.inventory + self.order + self.payment
    }
}

impl Default for SagaTimeouts {
    fn default() -> Self {
        Self {
            inventory: Duration::from_secs(5),
            order: Duration::from_secs(10),
            payment: Duration::from_secs(30),
        }
    }
}

/// Configuration for the checkout coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutConfig {
    pub timeouts: SagaTimeouts,
    /// Session and reservation TTL when the request does not set one.
    pub default_ttl: Duration,
    /// Upper bound on compensation after a shutdown aborted a step.
    pub compensation_grace: Duration,
    pub inventory_breaker: CircuitBreakerConfig,
    pub order_breaker: CircuitBreakerConfig,
    pub payment_breaker: CircuitBreakerConfig,
}

impl CheckoutConfig {
    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<(), String> {
        let SagaTimeouts {
            inventory,
            order,
            payment,
        } = self.timeouts;
        if inventory.is_zero() || order.is_zero() || payment.is_zero() {
            return Err("step timeouts must be positive".to_string());
        }
        if self.default_ttl.as_secs() == 0 {
            return Err("default_ttl must be at least one second".to_string());
        }
        self.inventory_breaker.validate()?;
        self.order_breaker.validate()?;
        self.payment_breaker.validate()?;
        Ok(())
    }
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            timeouts: SagaTimeouts::default(),
            default_ttl: Duration::from_secs(900),
            compensation_grace: Duration::from_secs(5),
            inventory_breaker: CircuitBreakerConfig::named("inventory"),
            order_breaker: CircuitBreakerConfig::named("order"),
            payment_breaker: CircuitBreakerConfig::named("payment"),
        }
    }
}

/// Configuration for the expiry reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Maximum rows handled per sweep, per table.
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}
