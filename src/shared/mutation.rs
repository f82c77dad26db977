//! Cart Mutations
//!
//! The closed set of changes the UI may request. Each mutation knows how to
//! replay itself against a cart, which is what the optimistic manager uses to
//! compute tentative states and to rebuild state after a rollback.
use crate::shared::cart::{Cart, CartItem};
use serde::{Deserialize, Serialize};

/// Kind of a cart mutation, used for logging, debounce keys and wire tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    AddItem,
    UpdateQuantity,
    RemoveItem,
    ClearCart,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationType::AddItem => "ADD_ITEM",
            OperationType::UpdateQuantity => "UPDATE_QUANTITY",
            OperationType::RemoveItem => "REMOVE_ITEM",
            OperationType::ClearCart => "CLEAR_CART",
        };
        f.write_str(name)
    }
}

/// A change to the cart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum CartMutation {
    /// Add units of a product, creating the line if needed
    AddItem {
        product_id: String,
        quantity: u32,
        unit_price: i64,
    },
    /// Set the quantity of an existing line; zero removes it
    UpdateQuantity { product_id: String, quantity: u32 },
    /// Remove a line
    RemoveItem { product_id: String },
    /// Empty the cart
    ClearCart,
}

impl CartMutation {
    pub fn kind(&self) -> OperationType {
        match self {
            CartMutation::AddItem { .. } => OperationType::AddItem,
            CartMutation::UpdateQuantity { .. } => OperationType::UpdateQuantity,
            CartMutation::RemoveItem { .. } => OperationType::RemoveItem,
            CartMutation::ClearCart => OperationType::ClearCart,
        }
    }

    /// Product touched by the mutation, if any
    pub fn product_id(&self) -> Option<&str> {
        match self {
            CartMutation::AddItem { product_id, .. }
            | CartMutation::UpdateQuantity { product_id, .. }
            | CartMutation::RemoveItem { product_id } => Some(product_id),
            CartMutation::ClearCart => None,
        }
    }

    /// Replay the mutation against a cart, returning the next state.
    ///
    /// Updating or removing a product that is not in the cart leaves the
    /// items untouched.
    pub fn apply_to(&self, cart: &Cart) -> Cart {
        let mut next = cart.clone();
        match self {
            CartMutation::AddItem {
                product_id,
                quantity,
                unit_price,
            } => {
                if *quantity == 0 {
                    return next;
                }
                match next.item_mut(product_id) {
                    Some(item) => {
                        let total = item.quantity.saturating_add(*quantity);
                        item.set_quantity(total);
                    }
                    None => next
                        .items
                        .push(CartItem::new(product_id.clone(), *quantity, *unit_price)),
                }
            }
            CartMutation::UpdateQuantity {
                product_id,
                quantity,
            } => {
                if let Some(item) = next.item_mut(product_id) {
                    item.set_quantity(*quantity);
                }
            }
            CartMutation::RemoveItem { product_id } => {
                next.items.retain(|item| &item.product_id != product_id);
            }
            CartMutation::ClearCart => {
                next.items.clear();
                next.stock_warnings.clear();
            }
        }
        next.touch();
        next
    }
}
