//! HTTP Cart API client against a mock server

use crate::assert_ok;
use crate::common::*;
use assert_matches::assert_matches;
use cartsync::api::{CartApi, HttpCartApi};
use cartsync::broadcast::PlatformCapabilities;
use cartsync::session::{CartSession, MutationOutcome, SessionParts};
use cartsync::shared::ApiError;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cart_json(session_id: &str, lines: &[(&str, u32)]) -> serde_json::Value {
    serde_json::to_value(cart_with(session_id, lines)).unwrap()
}

#[tokio::test]
async fn test_get_cart_decodes_server_cart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/cart/s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cart_json("s1", &[("book", 2)])))
        .expect(1)
        .mount(&server)
        .await;

    let api = HttpCartApi::new(server.uri()).unwrap();
    let cart = assert_ok!(api.get_cart("s1").await);
    assert_eq!(cart.quantity_of("book"), 2);
    assert_eq!(cart.total_price, 2 * DEFAULT_UNIT_PRICE);
}

#[tokio::test]
async fn test_mutation_routes_and_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/cart/s1/items"))
        .and(body_json(json!({ "productId": "book", "quantity": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(cart_json("s1", &[("book", 2)])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/cart/s1/items/book"))
        .and(body_json(json!({ "quantity": 5 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(cart_json("s1", &[("book", 5)])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/cart/s1/items/book"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cart_json("s1", &[])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/cart/s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cart_json("s1", &[])))
        .expect(1)
        .mount(&server)
        .await;

    let api = HttpCartApi::new(server.uri()).unwrap();
    assert_eq!(assert_ok!(api.add_item("s1", "book", 2).await).quantity_of("book"), 2);
    assert_eq!(assert_ok!(api.update_quantity("s1", "book", 5).await).quantity_of("book"), 5);
    assert!(assert_ok!(api.remove_item("s1", "book").await).is_empty());
    assert!(assert_ok!(api.clear_cart("s1").await).is_empty());
}

#[tokio::test]
async fn test_product_id_with_slash_is_one_segment() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/cart/s1/items/shirt%2FXL"))
        .and(body_json(json!({ "quantity": 3 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(cart_json("s1", &[("shirt/XL", 3)])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/cart/s1/items/shirt%2FXL"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cart_json("s1", &[])))
        .expect(1)
        .mount(&server)
        .await;

    let api = HttpCartApi::new(server.uri()).unwrap();
    assert_eq!(assert_ok!(api.update_quantity("s1", "shirt/XL", 3).await).quantity_of("shirt/XL"), 3);
    assert!(assert_ok!(api.remove_item("s1", "shirt/XL").await).is_empty());
}

#[tokio::test]
async fn test_error_classification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/cart/s1/items"))
        .respond_with(ResponseTemplate::new(409).set_body_string("out of stock"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/cart/s1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/cart/s1"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let api = HttpCartApi::with_timeout(server.uri(), Duration::from_millis(200)).unwrap();
    assert_matches!(
        api.add_item("s1", "book", 1).await,
        Err(ApiError::Rejected { status: 409, message }) if message == "out of stock"
    );
    assert_matches!(api.get_cart("s1").await, Err(ApiError::Decode(_)));
    assert_matches!(api.clear_cart("s1").await, Err(ApiError::Timeout));
}

#[tokio::test]
async fn test_session_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/cart/s1/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cart_json("s1", &[("book", 1)])))
        .mount(&server)
        .await;

    let parts = SessionParts {
        api: std::sync::Arc::new(HttpCartApi::new(server.uri()).unwrap()),
        store: memory_store(),
        capabilities: PlatformCapabilities::default(),
        transport: None,
        fallback: None,
    };
    let session = CartSession::new(test_config("s1"), parts).unwrap();

    let outcome = assert_ok!(session.add_to_cart("book", 1, DEFAULT_UNIT_PRICE).await);
    assert_matches!(outcome, MutationOutcome::Applied(cart) if cart.quantity_of("book") == 1);
    session.shutdown().await;
}
