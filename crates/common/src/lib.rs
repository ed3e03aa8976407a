//! Shared building blocks for the checkout and inventory crates.

pub mod clock;
pub mod error;
pub mod money;
pub mod retry;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Classify, ErrorKind};
pub use money::{Currency, CurrencyError, Money};
pub use retry::RetryPolicy;
pub use types::{
    CheckoutId, OrderId, PaymentId, ProductId, ReservationId, UserId, VariantId, WarehouseId,
};
