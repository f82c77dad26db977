//! Remote Cart API
//!
//! The server owns the authoritative cart. Every call returns the full cart
//! after the change, or an [`ApiError`] classifying why it did not happen.

pub mod http;

pub use http::HttpCartApi;

use crate::shared::cart::Cart;
use crate::shared::error::ApiError;
use crate::shared::mutation::CartMutation;
use async_trait::async_trait;

/// Calls made against the remote cart service
#[async_trait]
pub trait CartApi: Send + Sync {
    async fn get_cart(&self, session_id: &str) -> Result<Cart, ApiError>;

    async fn add_item(&self, session_id: &str, product_id: &str, quantity: u32) -> Result<Cart, ApiError>;

    async fn update_quantity(&self, session_id: &str, product_id: &str, quantity: u32) -> Result<Cart, ApiError>;

    async fn remove_item(&self, session_id: &str, product_id: &str) -> Result<Cart, ApiError>;

    async fn clear_cart(&self, session_id: &str) -> Result<Cart, ApiError>;

    /// Send a mutation to the matching endpoint
    async fn execute(&self, session_id: &str, mutation: &CartMutation) -> Result<Cart, ApiError> {
        match mutation {
            CartMutation::AddItem {
                product_id, quantity, ..
            } => self.add_item(session_id, product_id, *quantity).await,
            CartMutation::UpdateQuantity { product_id, quantity } => {
                self.update_quantity(session_id, product_id, *quantity).await
            }
            CartMutation::RemoveItem { product_id } => self.remove_item(session_id, product_id).await,
            CartMutation::ClearCart => self.clear_cart(session_id).await,
        }
    }
}
