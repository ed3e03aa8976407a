//! Circuit breaker configuration.

use std::time::Duration;

/// Settings for a single circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Name used in logs and metrics, usually the dependency name.
    pub name: String,
    /// Maximum concurrent probes while half-open, and the number of consecutive
    /// probe successes needed to close again.
    pub max_requests: u32,
    /// Length of the rolling counting window while closed. Zero never resets.
    pub interval: Duration,
    /// How long the breaker stays open before allowing probes.
    pub timeout: Duration,
    /// The breaker trips once the failure ratio exceeds this value.
    pub failure_ratio: f64,
    /// Minimum number of calls in the window before the ratio is considered.
    pub min_requests: u32,
}

impl CircuitBreakerConfig {
    /// Creates a config with defaults for the named dependency.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Checks that the settings are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("circuit breaker name must not be empty".to_string());
        }
        if self.max_requests == 0 {
            return Err(format!("{}: max_requests must be at least 1", self.name));
        }
        if !(self.failure_ratio > 0.0 && self.failure_ratio < 1.0) {
            return Err(format!(
                "{}: failure_ratio must be in (0, 1), got {}",
                self.name, self.failure_ratio
            ));
        }
        if self.timeout.is_zero() {
            return Err(format!("{}: timeout must be positive", self.name));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_ratio: 0.6,
            min_requests: 5,
        }
    }
}
