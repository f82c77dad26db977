//! # Cart Reconciliation
//!
//! Merges two divergent cart states into one. Used when a recovered snapshot
//! meets an in-memory cart, and by anything else that must combine carts
//! arriving from different replicas.
//!
//! ## Strategies
//!
//! - **Replace**: take the incoming cart wholesale
//! - **KeepNewer**: keep whichever cart has the later `updated_at`
//! - **MergeItems** (default): union of product ids, larger quantity wins for
//!   products present in both, totals recomputed. It is the only strategy that
//!   cannot drop a concurrent local addition.
//!
//! ## Usage
//!
//! ```rust
//! use cartsync::offline::reconciliation::{reconcile, MergeStrategy};
//! use cartsync::shared::{Cart, CartItem};
//!
//! let local = Cart::with_items("s1", vec![CartItem::new("book", 2, 500)]);
//! let remote = Cart::with_items("s1", vec![CartItem::new("pen", 1, 100)]);
//! let merged = reconcile(&local, &remote, MergeStrategy::MergeItems);
//! assert_eq!(merged.cart.total_items, 3);
//! ```

use crate::shared::cart::{Cart, CartItem, StockWarning};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rule used to reconcile two cart states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    /// Take the incoming state
    Replace,
    /// Compare `updated_at`, ties keep the local state
    KeepNewer,
    /// Union of items, larger quantity wins
    #[default]
    MergeItems,
}

/// A product whose quantity differed between the two carts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemConflict {
    pub product_id: String,
    pub local_quantity: u32,
    pub incoming_quantity: u32,
}

/// Outcome of a reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    /// The reconciled cart
    pub cart: Cart,
    /// Strategy that produced it
    pub strategy: MergeStrategy,
    /// Products present in both carts with different quantities
    pub conflicts: Vec<ItemConflict>,
}

/// Reconcile `local` with `incoming`
pub fn reconcile(local: &Cart, incoming: &Cart, strategy: MergeStrategy) -> ReconciliationResult {
    let conflicts = detect_conflicts(local, incoming);
    let cart = match strategy {
        MergeStrategy::Replace => incoming.clone(),
        MergeStrategy::KeepNewer => {
            if incoming.updated_at > local.updated_at {
                incoming.clone()
            } else {
                local.clone()
            }
        }
        MergeStrategy::MergeItems => merge_items(local, incoming),
    };

    if !conflicts.is_empty() {
        tracing::debug!(
            session_id = %local.session_id,
            ?strategy,
            conflicts = conflicts.len(),
            "Reconciled diverging carts"
        );
    }

    ReconciliationResult {
        cart,
        strategy,
        conflicts,
    }
}

/// Union of both item sets; for shared products the larger quantity wins.
///
/// Everything except line order is independent of argument order. Lines keep
/// the local insertion order, followed by incoming-only lines. The VAT rate
/// comes from the newer cart, the higher rate on a tie.
pub fn merge_items(local: &Cart, incoming: &Cart) -> Cart {
    let mut merged = local.clone();
    merged.items = Vec::with_capacity(local.items.len() + incoming.items.len());

    for item in &local.items {
        let chosen = match incoming.item(&item.product_id) {
            Some(other) => pick_line(item, other),
            None => item,
        };
        merged.items.push(chosen.clone());
    }
    for item in &incoming.items {
        if local.item(&item.product_id).is_none() {
            merged.items.push(item.clone());
        }
    }

    merged.stock_warnings = merge_warnings(&local.stock_warnings, &incoming.stock_warnings);
    merged.updated_at = local.updated_at.max(incoming.updated_at);
    merged.vat_rate_bps = (local.updated_at, local.vat_rate_bps)
        .max((incoming.updated_at, incoming.vat_rate_bps))
        .1;
    merged.recalculate();
    merged
}

/// Deterministic choice between two lines for the same product
fn pick_line<'a>(a: &'a CartItem, b: &'a CartItem) -> &'a CartItem {
    let key = |item: &CartItem| (item.quantity, item.unit_price, item.subtotal);
    if key(b) > key(a) {
        b
    } else {
        a
    }
}

/// One warning per product: lowest `available`, then highest `requested`
fn merge_warnings(local: &[StockWarning], incoming: &[StockWarning]) -> Vec<StockWarning> {
    let severity = |w: &StockWarning| (std::cmp::Reverse(w.available), w.requested);
    let mut by_product: BTreeMap<&str, &StockWarning> = BTreeMap::new();
    for warning in local.iter().chain(incoming) {
        by_product
            .entry(warning.product_id.as_str())
            .and_modify(|existing| {
                if severity(warning) > severity(existing) {
                    *existing = warning;
                }
            })
            .or_insert(warning);
    }
    by_product.into_values().cloned().collect()
}

fn detect_conflicts(local: &Cart, incoming: &Cart) -> Vec<ItemConflict> {
    local
        .items
        .iter()
        .filter_map(|item| {
            let other = incoming.item(&item.product_id)?;
            (other.quantity != item.quantity).then(|| ItemConflict {
                product_id: item.product_id.clone(),
                local_quantity: item.quantity,
                incoming_quantity: other.quantity,
            })
        })
        .collect()
}
