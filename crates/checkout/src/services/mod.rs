//! Collaborator contracts consumed by the coordinator, with in-process implementations.
//!
//! Every call carries the checkout ID as its idempotency key, so a resumed
//! saga never duplicates a side effect.

pub mod inventory;
pub mod order;
pub mod payment;

pub use inventory::InventoryService;
pub use order::{InMemoryOrderService, OrderRecord, OrderRequest, OrderService, OrderStatus};
pub use payment::{ChargeRequest, InMemoryPaymentService, PaymentRecord, PaymentService};
