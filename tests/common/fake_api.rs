//! In-process Cart API
//!
//! Keeps one authoritative cart per session and applies mutations the way a
//! real server would. The network can be switched off, and every call can be
//! made to fail with a status or to take a while.

use async_trait::async_trait;
use cartsync::api::CartApi;
use cartsync::shared::{ApiError, Cart, CartMutation};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_UNIT_PRICE: i64 = 1_000;

#[derive(Default)]
pub struct FakeCartApi {
    carts: Mutex<HashMap<String, Cart>>,
    offline: AtomicBool,
    reject_status: Mutex<Option<u16>>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<String>>,
}

impl FakeCartApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start with `cart` as the server state of its session
    pub fn with_cart(cart: Cart) -> Arc<Self> {
        let api = Self::default();
        api.carts.lock().insert(cart.session_id.clone(), cart);
        Arc::new(api)
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Fail every mutation with this HTTP status until cleared
    pub fn reject_with(&self, status: Option<u16>) {
        *self.reject_status.lock() = status;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn server_cart(&self, session_id: &str) -> Cart {
        self.carts
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| Cart::empty(session_id))
    }

    /// Calls received so far, as `KIND product`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn respond(&self, session_id: &str, mutation: Option<CartMutation>) -> Result<Cart, ApiError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::offline("connection refused"));
        }

        let Some(mutation) = mutation else {
            return Ok(self.server_cart(session_id));
        };
        self.calls.lock().push(format!(
            "{} {}",
            mutation.kind(),
            mutation.product_id().unwrap_or("*")
        ));
        if let Some(status) = *self.reject_status.lock() {
            return Err(ApiError::rejected(status, "rejected by test"));
        }

        let mut carts = self.carts.lock();
        let cart = carts
            .entry(session_id.to_string())
            .or_insert_with(|| Cart::empty(session_id));
        *cart = mutation.apply_to(cart);
        Ok(cart.clone())
    }
}

#[async_trait]
impl CartApi for FakeCartApi {
    async fn get_cart(&self, session_id: &str) -> Result<Cart, ApiError> {
        self.respond(session_id, None).await
    }

    async fn add_item(&self, session_id: &str, product_id: &str, quantity: u32) -> Result<Cart, ApiError> {
        let mutation = CartMutation::AddItem {
            product_id: product_id.to_string(),
            quantity,
            unit_price: DEFAULT_UNIT_PRICE,
        };
        self.respond(session_id, Some(mutation)).await
    }

    async fn update_quantity(&self, session_id: &str, product_id: &str, quantity: u32) -> Result<Cart, ApiError> {
        let mutation = CartMutation::UpdateQuantity {
            product_id: product_id.to_string(),
            quantity,
        };
        self.respond(session_id, Some(mutation)).await
    }

    async fn remove_item(&self, session_id: &str, product_id: &str) -> Result<Cart, ApiError> {
        let mutation = CartMutation::RemoveItem {
            product_id: product_id.to_string(),
        };
        self.respond(session_id, Some(mutation)).await
    }

    async fn clear_cart(&self, session_id: &str) -> Result<Cart, ApiError> {
        self.respond(session_id, Some(CartMutation::ClearCart)).await
    }
}
