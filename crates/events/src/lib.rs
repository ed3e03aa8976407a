//! Domain events emitted by the checkout saga and the inventory engine.
//!
//! Publishing is best effort: a publisher never blocks the caller and never
//! returns an error. Consumers (notification, search, analytics) live outside
//! this workspace.

pub mod event;
pub mod publisher;

pub use event::{
    CheckoutCompletedData, CheckoutExpiredData, CheckoutFailedData, DomainEvent, EventEnvelope,
    StockLowData,
};
pub use publisher::{BroadcastPublisher, EventPublisher, SharedPublisher, TracingPublisher};
