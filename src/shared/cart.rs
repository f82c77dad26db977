//! Cart Data Model
//!
//! The cart is the single piece of shared mutable state in the sync engine.
//! It is owned by the session controller and every other component receives
//! it by value.
//!
//! Money is carried in integer minor units (cents) so that totals, checksums
//! and merges are exact.
//!
//! # Invariants
//!
//! After every call to [`Cart::recalculate`]:
//! - `total_items` is the sum of item quantities
//! - `total_price` is the sum of item subtotals
//! - every item has `quantity > 0`
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// VAT rate applied to locally computed totals, in basis points (20%).
pub const DEFAULT_VAT_RATE_BPS: u32 = 2_000;

fn default_vat_rate() -> u32 {
    DEFAULT_VAT_RATE_BPS
}

/// A single line of the cart, keyed by product id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    /// Unique key of the line within a cart
    pub product_id: String,
    /// Always greater than zero
    pub quantity: u32,
    /// Price of one unit in minor units
    pub unit_price: i64,
    /// `quantity * unit_price` unless the server says otherwise
    pub subtotal: i64,
}

impl CartItem {
    /// Create a line with its subtotal computed from quantity and unit price
    pub fn new(product_id: impl Into<String>, quantity: u32, unit_price: i64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            unit_price,
            subtotal: unit_price.saturating_mul(i64::from(quantity)),
        }
    }

    /// Set a new quantity and recompute the subtotal
    pub fn set_quantity(&mut self, quantity: u32) {
        self.quantity = quantity;
        self.subtotal = self.unit_price.saturating_mul(i64::from(quantity));
    }
}

/// Stock problem reported by the server for one product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockWarning {
    pub product_id: String,
    pub requested: u32,
    pub available: u32,
}

/// Shopping cart state for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    /// Session the cart belongs to
    pub session_id: String,
    /// Lines in insertion order
    pub items: Vec<CartItem>,
    /// Sum of quantities
    pub total_items: u32,
    /// Sum of subtotals
    pub total_price: i64,
    /// `total_price` with VAT applied
    #[serde(rename = "totalPriceWithVAT")]
    pub total_price_with_vat: i64,
    #[serde(default)]
    pub stock_warnings: Vec<StockWarning>,
    /// Last time the cart changed
    pub updated_at: DateTime<Utc>,
    /// Rate used when totals are recomputed locally
    #[serde(default = "default_vat_rate")]
    pub vat_rate_bps: u32,
}

impl Cart {
    /// Create an empty cart for a session
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            items: Vec::new(),
            total_items: 0,
            total_price: 0,
            total_price_with_vat: 0,
            stock_warnings: Vec::new(),
            updated_at: Utc::now(),
            vat_rate_bps: DEFAULT_VAT_RATE_BPS,
        }
    }

    /// Build a cart from lines, computing every derived field
    pub fn with_items(session_id: impl Into<String>, items: Vec<CartItem>) -> Self {
        let mut cart = Self::empty(session_id);
        cart.items = items;
        cart.recalculate();
        cart
    }

    /// Replace the VAT rate and recompute totals
    pub fn with_vat_rate(mut self, vat_rate_bps: u32) -> Self {
        self.vat_rate_bps = vat_rate_bps;
        self.recalculate();
        self
    }

    /// Look up a line by product id
    pub fn item(&self, product_id: &str) -> Option<&CartItem> {
        self.items.iter().find(|item| item.product_id == product_id)
    }

    pub fn item_mut(&mut self, product_id: &str) -> Option<&mut CartItem> {
        self.items.iter_mut().find(|item| item.product_id == product_id)
    }

    /// Quantity of a product, zero when absent
    pub fn quantity_of(&self, product_id: &str) -> u32 {
        self.item(product_id).map_or(0, |item| item.quantity)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop empty lines and recompute all derived totals
    pub fn recalculate(&mut self) {
        self.items.retain(|item| item.quantity > 0);
        self.total_items = self
            .items
            .iter()
            .fold(0u32, |acc, item| acc.saturating_add(item.quantity));
        self.total_price = self
            .items
            .iter()
            .fold(0i64, |acc, item| acc.saturating_add(item.subtotal));
        self.total_price_with_vat = apply_vat(self.total_price, self.vat_rate_bps);
    }

    /// Recompute totals and stamp the modification time
    pub fn touch(&mut self) {
        self.recalculate();
        self.updated_at = Utc::now();
    }

    /// Whether the derived totals agree with the item list
    pub fn is_consistent(&self) -> bool {
        let quantities: u64 = self.items.iter().map(|item| u64::from(item.quantity)).sum();
        let subtotals: i128 = self.items.iter().map(|item| i128::from(item.subtotal)).sum();

        self.items.iter().all(|item| item.quantity > 0)
            && quantities == u64::from(self.total_items)
            && subtotals == i128::from(self.total_price)
    }

    /// Product ids in insertion order
    pub fn product_ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.product_id.as_str())
    }
}

/// Add VAT to an amount, rounding half up
pub fn apply_vat(amount: i64, vat_rate_bps: u32) -> i64 {
    let gross = i128::from(amount) * (10_000 + i128::from(vat_rate_bps));
    let rounded = if gross >= 0 {
        (gross + 5_000) / 10_000
    } else {
        (gross - 5_000) / 10_000
    };
    i64::try_from(rounded).unwrap_or(if rounded > 0 { i64::MAX } else { i64::MIN })
}
