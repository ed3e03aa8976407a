//! Resilience wrappers for unreliable downstream dependencies.
//!
//! A [`CircuitBreaker`] guards one dependency. It is cheap to clone and every
//! clone shares the same counters, so one instance per dependency can be handed
//! to many concurrent sagas.

pub mod breaker;
pub mod config;
pub mod error;
pub mod state;

pub use breaker::{CircuitBreaker, Counts};
pub use config::CircuitBreakerConfig;
pub use error::{BreakerError, Rejected};
pub use state::CircuitState;
