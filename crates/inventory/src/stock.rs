//! Stock rows and adjustment reasons.

use common::{ProductId, VariantId, WarehouseId};
use serde::{Deserialize, Serialize};

/// Identifies one stock row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
}

impl StockKey {
    /// Creates a key.
    pub fn new(
        product_id: impl Into<ProductId>,
        variant_id: impl Into<VariantId>,
        warehouse_id: impl Into<WarehouseId>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            variant_id: variant_id.into(),
            warehouse_id: warehouse_id.into(),
        }
    }
}

impl std::fmt::Display for StockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.product_id, self.variant_id, self.warehouse_id
        )
    }
}

/// On-hand and reserved quantities for one SKU in one warehouse.
///
/// Invariant: `0 <= reserved <= quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    pub key: StockKey,
    /// Units on hand.
    pub quantity: i64,
    /// Units held by active reservations.
    pub reserved: i64,
    /// Available quantity at or below which `stock.low` is emitted.
    pub low_stock_threshold: i64,
}

impl Stock {
    /// Creates a stock row with nothing reserved.
    pub fn new(key: StockKey, quantity: i64, low_stock_threshold: i64) -> Self {
        Self {
            key,
            quantity,
            reserved: 0,
            low_stock_threshold,
        }
    }

    /// Units that can still be reserved.
    pub fn available(&self) -> i64 {
        self.quantity - self.reserved
    }

    /// Returns true if available stock is at or below the threshold.
    pub fn is_low(&self) -> bool {
        self.available() <= self.low_stock_threshold
    }

    /// Returns true if the row satisfies `0 <= reserved <= quantity`.
    pub fn is_consistent(&self) -> bool {
        0 <= self.reserved && self.reserved <= self.quantity
    }
}

/// Why a stock quantity was adjusted outside the checkout flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    Order,
    Return,
    Adjustment,
    Reservation,
}

impl AdjustmentReason {
    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentReason::Order => "order",
            AdjustmentReason::Return => "return",
            AdjustmentReason::Adjustment => "adjustment",
            AdjustmentReason::Reservation => "reservation",
        }
    }
}

impl std::fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AdjustmentReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(AdjustmentReason::Order),
            "return" => Ok(AdjustmentReason::Return),
            "adjustment" => Ok(AdjustmentReason::Adjustment),
            "reservation" => Ok(AdjustmentReason::Reservation),
            other => Err(format!("unknown adjustment reason: {other}")),
        }
    }
}
