use crate::shared::cart::Cart;
use sha2::{Digest, Sha256};

/// Hex SHA-256 digest of the parts of a cart that matter for recovery:
/// session id, each line's product, quantity and subtotal, and the totals.
///
/// Timestamps and warnings are left out so re-saving an unchanged cart
/// yields the same digest.
pub fn cart_checksum(cart: &Cart) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cart.session_id.as_bytes());
    for item in &cart.items {
        hasher.update(b"|");
        hasher.update(item.product_id.as_bytes());
        hasher.update(format!(":{}:{}", item.quantity, item.subtotal).as_bytes());
    }
    hasher.update(format!("|{}|{}", cart.total_items, cart.total_price).as_bytes());
    hex::encode(hasher.finalize())
}
