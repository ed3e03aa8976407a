//! Checkout saga coordinator.
//!
//! A checkout reserves stock, creates an order and charges payment. Each
//! step's side effect is recorded on a persisted [`CheckoutSession`] before
//! the next step starts; when a step fails the recorded effects are undone
//! in reverse order. The [`ExpiryReaper`] reclaims whatever a crashed or
//! abandoned checkout left behind.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod reaper;
pub mod services;
pub mod session;
pub mod state;
pub mod steps;
pub mod store;

pub use config::{CheckoutConfig, ReaperConfig, SagaTimeouts};
pub use coordinator::{CheckoutCoordinator, Collaborators};
pub use error::{CheckoutError, Result};
pub use reaper::{ExpiryReaper, ReaperReport, ReservationSweeper};
pub use services::{
    ChargeRequest, InMemoryOrderService, InMemoryPaymentService, InventoryService, OrderRecord,
    OrderRequest, OrderService, OrderStatus, PaymentRecord, PaymentService,
};
pub use session::{Address, CheckoutItem, CheckoutSession, NewCheckoutItem, StartCheckout, Totals};
pub use state::CheckoutStatus;
pub use steps::SagaStep;
pub use store::{InMemorySessionStore, PostgresSessionStore, SessionStore};
