//! HTTP Cart API client
//!
//! Routes, relative to the configured base URL:
//!
//! | Call              | Route                                  |
//! |-------------------|----------------------------------------|
//! | `get_cart`        | `GET    /api/cart/{session}`           |
//! | `add_item`        | `POST   /api/cart/{session}/items`     |
//! | `update_quantity` | `PUT    /api/cart/{session}/items/{id}`|
//! | `remove_item`     | `DELETE /api/cart/{session}/items/{id}`|
//! | `clear_cart`      | `DELETE /api/cart/{session}`           |
//!
//! Ids are percent-encoded, so each one stays a single path segment.

use super::CartApi;
use crate::shared::cart::Cart;
use crate::shared::error::ApiError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use std::time::Duration;
use url::Url;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddItemRequest<'a> {
    product_id: &'a str,
    quantity: u32,
}

#[derive(Serialize)]
struct UpdateQuantityRequest {
    quantity: u32,
}

/// Cart API client over reqwest
#[derive(Debug, Clone)]
pub struct HttpCartApi {
    base_url: Url,
    client: Client,
}

impl HttpCartApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = base_url.into();
        let base_url = Url::parse(&base_url).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::offline(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { base_url, client })
    }

    /// `{base}/api/cart/` followed by `segments`, each escaped on its own
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "cart"])
            .extend(segments);
        Ok(url)
    }

    fn cart_url(&self, session_id: &str) -> Result<Url, ApiError> {
        self.endpoint(&[session_id])
    }

    fn items_url(&self, session_id: &str) -> Result<Url, ApiError> {
        self.endpoint(&[session_id, "items"])
    }

    fn item_url(&self, session_id: &str, product_id: &str) -> Result<Url, ApiError> {
        self.endpoint(&[session_id, "items", product_id])
    }

    async fn send(&self, request: RequestBuilder) -> Result<Cart, ApiError> {
        let response = request.send().await.map_err(classify)?;
        decode(response).await
    }
}

/// Map a reqwest failure onto the API error taxonomy
fn classify(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else if err.is_connect() || err.is_request() {
        ApiError::offline(err.to_string())
    } else if err.is_decode() || err.is_body() {
        ApiError::Decode(err.to_string())
    } else {
        ApiError::offline(err.to_string())
    }
}

async fn decode(response: Response) -> Result<Cart, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .ok()
            .filter(|body| !body.is_empty())
            .unwrap_or_else(|| status.to_string());
        return Err(ApiError::rejected(status.as_u16(), message));
    }

    let body = response.bytes().await.map_err(classify)?;
    serde_json::from_slice::<Cart>(&body).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl CartApi for HttpCartApi {
    async fn get_cart(&self, session_id: &str) -> Result<Cart, ApiError> {
        self.send(self.client.get(self.cart_url(session_id)?)).await
    }

    async fn add_item(&self, session_id: &str, product_id: &str, quantity: u32) -> Result<Cart, ApiError> {
        let body = AddItemRequest { product_id, quantity };
        self.send(self.client.post(self.items_url(session_id)?).json(&body)).await
    }

    async fn update_quantity(&self, session_id: &str, product_id: &str, quantity: u32) -> Result<Cart, ApiError> {
        let url = self.item_url(session_id, product_id)?;
        self.send(self.client.put(url).json(&UpdateQuantityRequest { quantity }))
            .await
    }

    async fn remove_item(&self, session_id: &str, product_id: &str) -> Result<Cart, ApiError> {
        self.send(self.client.delete(self.item_url(session_id, product_id)?))
            .await
    }

    async fn clear_cart(&self, session_id: &str) -> Result<Cart, ApiError> {
        self.send(self.client.delete(self.cart_url(session_id)?)).await
    }
}
