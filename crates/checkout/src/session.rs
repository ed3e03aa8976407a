//! Checkout session model and totals.

use chrono::{DateTime, Utc};
use common::{
    CheckoutId, Currency, Money, OrderId, PaymentId, ProductId, ReservationId, UserId, VariantId,
};
use serde::{Deserialize, Serialize};

use crate::state::CheckoutStatus;

/// A postal address. Stored as JSON alongside the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub postal_code: String,
    /// ISO 3166-1 alpha-2 country code.
    pub country: String,
}

/// A line requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCheckoutItem {
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub name: String,
    pub sku: String,
    pub unit_price: Money,
    pub quantity: u32,
}

/// A line of a persisted checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutItem {
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub name: String,
    pub sku: String,
    pub unit_price: Money,
    pub quantity: u32,
    /// Set once the line's stock is held.
    #[serde(default)]
    pub reservation_id: Option<ReservationId>,
}

impl From<NewCheckoutItem> for CheckoutItem {
    fn from(item: NewCheckoutItem) -> Self {
        Self {
            product_id: item.product_id,
            variant_id: item.variant_id,
            name: item.name,
            sku: item.sku,
            unit_price: item.unit_price,
            quantity: item.quantity,
            reservation_id: None,
        }
    }
}

/// Request to start a checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCheckout {
    /// Idempotency key. A fresh one is generated when absent.
    #[serde(default)]
    pub checkout_id: Option<CheckoutId>,
    pub user_id: UserId,
    pub items: Vec<NewCheckoutItem>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub discount_amount: Money,
    #[serde(default)]
    pub shipping_amount: Money,
    #[serde(default)]
    pub shipping_address: Option<Address>,
    #[serde(default)]
    pub billing_address: Option<Address>,
    #[serde(default)]
    pub payment_method: Option<String>,
    /// Session and reservation TTL. Falls back to the configured default.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_currency() -> String {
    Currency::default().to_string()
}

impl StartCheckout {
    pub fn new(user_id: UserId, items: Vec<NewCheckoutItem>) -> Self {
        Self {
            checkout_id: None,
            user_id,
            items,
            currency: default_currency(),
            discount_amount: Money::zero(),
            shipping_amount: Money::zero(),
            shipping_address: None,
            billing_address: None,
            payment_method: None,
            ttl_secs: None,
        }
    }

    pub fn with_checkout_id(mut self, id: CheckoutId) -> Self {
        self.checkout_id = Some(id);
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_discount(mut self, amount: Money) -> Self {
        self.discount_amount = amount;
        self
    }

    pub fn with_shipping(mut self, amount: Money) -> Self {
        self.shipping_amount = amount;
        self
    }

    pub fn with_shipping_address(mut self, address: Address) -> Self {
        self.shipping_address = Some(address);
        self
    }

    pub fn with_payment_method(mut self, method: impl Into<String>) -> Self {
        self.payment_method = Some(method.into());
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }
}

/// Amounts derived from the items, discount and shipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Money,
    pub discount: Money,
    pub shipping: Money,
    pub total: Money,
}

impl Totals {
    /// Computes `total = max(0, subtotal - discount + shipping)`.
    ///
    /// Fails on negative inputs or arithmetic overflow.
    pub fn compute(
        items: &[CheckoutItem],
        discount: Money,
        shipping: Money,
    ) -> Result<Self, String> {
        if discount.is_negative() {
            return Err(format!("discount must not be negative, got {discount}"));
        }
        if shipping.is_negative() {
            return Err(format!("shipping must not be negative, got {shipping}"));
        }

        let mut subtotal = Money::zero();
        for item in items {
            if item.unit_price.is_negative() {
                return Err(format!("unit price for {} must not be negative", item.sku));
            }
            subtotal = item
                .unit_price
                .checked_mul(item.quantity)
                .and_then(|line| subtotal.checked_add(line))
                .ok_or_else(|| "subtotal overflows".to_string())?;
        }

        let total = subtotal
            .checked_sub(discount)
            .and_then(|m| m.checked_add(shipping))
            .ok_or_else(|| "total overflows".to_string())?
            .clamp_non_negative();

        Ok(Self {
            subtotal,
            discount,
            shipping,
            total,
        })
    }
}

/// Persisted state of one checkout saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Also the idempotency key passed to every collaborator.
    pub id: CheckoutId,
    pub user_id: UserId,
    pub status: CheckoutStatus,
    pub items: Vec<CheckoutItem>,
    pub subtotal_amount: Money,
    pub discount_amount: Money,
    pub shipping_amount: Money,
    pub total_amount: Money,
    pub currency: Currency,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub payment_method: Option<String>,
    pub payment_id: Option<PaymentId>,
    pub order_id: Option<OrderId>,
    pub failure_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutSession {
    /// Returns the reservation IDs recorded so far, in item order.
    pub fn reservation_ids(&self) -> Vec<ReservationId> {
        self.items.iter().filter_map(|i| i.reservation_id).collect()
    }

    /// Returns true if the session is open and past its deadline.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at < now
    }

    pub fn totals(&self) -> Totals {
        Totals {
            subtotal: self.subtotal_amount,
            discount: self.discount_amount,
            shipping: self.shipping_amount,
            total: self.total_amount,
        }
    }
}
