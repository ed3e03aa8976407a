//! Application configuration loaded from environment variables.

use std::time::Duration;

use checkout::{CheckoutConfig, ReaperConfig};
use inventory::EngineConfig;
use resilience::CircuitBreakerConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for human-readable output
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory stores when unset
/// - `INVENTORY_TIMEOUT_MS`, `ORDER_TIMEOUT_MS`, `PAYMENT_TIMEOUT_MS`: step budgets
/// - `RESERVATION_TTL_SECS`: default session and reservation TTL
/// - `REAPER_INTERVAL_SECS`: time between expiry sweeps
/// - `BREAKER_MAX_REQUESTS`, `BREAKER_INTERVAL_SECS`, `BREAKER_TIMEOUT_SECS`,
///   `BREAKER_FAILURE_RATIO`, `BREAKER_MIN_REQUESTS`: applied to every breaker
///
/// Values that fail to parse fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub checkout: CheckoutConfig,
    pub engine: EngineConfig,
    pub reaper: ReaperConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let mut config = Self::default();

        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        if let Some(level) = lookup("RUST_LOG") {
            config.log_level = level;
        }
        if lookup("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")) {
            config.log_format = LogFormat::Json;
        }
        config.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let timeouts = &mut config.checkout.timeouts;
        if let Some(ms) = parsed("INVENTORY_TIMEOUT_MS") {
            timeouts.inventory = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed("ORDER_TIMEOUT_MS") {
            timeouts.order = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed("PAYMENT_TIMEOUT_MS") {
            timeouts.payment = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed("RESERVATION_TTL_SECS").filter(|s| *s > 0) {
            config.checkout.default_ttl = Duration::from_secs(secs);
            config.engine.default_ttl_secs = secs;
        }
        if let Some(secs) = parsed("REAPER_INTERVAL_SECS").filter(|s| *s > 0) {
            config.reaper.interval = Duration::from_secs(secs);
        }

        for breaker in [
            &mut config.checkout.inventory_breaker,
            &mut config.checkout.order_breaker,
            &mut config.checkout.payment_breaker,
        ] {
            apply_breaker_overrides(breaker, &lookup);
        }

        config
    }

    /// Checks every component configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.checkout.validate()?;
        self.engine.validate()?;
        if self.reaper.batch_size == 0 {
            return Err("reaper batch_size must be positive".to_string());
        }
        Ok(())
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn apply_breaker_overrides(
    breaker: &mut CircuitBreakerConfig,
    lookup: &impl Fn(&str) -> Option<String>,
) {
    let parse = |key: &str| lookup(key).map(|v| v.trim().to_string());
    if let Some(n) = parse("BREAKER_MAX_REQUESTS").and_then(|v| v.parse().ok()) {
        breaker.max_requests = n;
    }
    if let Some(secs) = parse("BREAKER_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        breaker.interval = Duration::from_secs(secs);
    }
    if let Some(secs) = parse("BREAKER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        breaker.timeout = Duration::from_secs(secs);
    }
    if let Some(ratio) = parse("BREAKER_FAILURE_RATIO").and_then(|v| v.parse().ok()) {
        breaker.failure_ratio = ratio;
    }
    if let Some(n) = parse("BREAKER_MIN_REQUESTS").and_then(|v| v.parse().ok()) {
        breaker.min_requests = n;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            checkout: CheckoutConfig::default(),
            engine: EngineConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}
