//! Cart session scenarios

use crate::common::*;
use crate::{assert_consistent, assert_ok};
use assert_matches::assert_matches;
use cartsync::broadcast::{BroadcastHub, PlatformCapabilities};
use cartsync::session::NetworkStatus;
use cartsync::shared::config::OptimisticConfig;
use cartsync::shared::{ApiError, CartError, SyncConfig};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_offline_addition_replays_when_back_online() {
    let api = FakeCartApi::with_cart(cart_with("s1", &[("bookX", 2)]));
    let session = session_with(test_config("s1"), api.clone(), memory_store(), PlatformCapabilities::default());
    assert_ok!(session.refresh_cart().await);
    assert_eq!(session.cart().quantity_of("bookX"), 2);

    api.set_online(false);
    let outcome = assert_ok!(session.add_to_cart("bookX", 1, DEFAULT_UNIT_PRICE).await);
    assert!(outcome.is_queued());
    assert_eq!(outcome.cart().quantity_of("bookX"), 3);
    assert_eq!(session.network_status(), NetworkStatus::Offline);
    assert_eq!(session.pending_operations(), 0);
    assert_eq!(session.queued_operations(), 1);
    assert_eq!(api.server_cart("s1").quantity_of("bookX"), 2);

    api.set_online(true);
    let mut status = session.watch();
    session.set_network_status(NetworkStatus::Online);
    let settled = wait_for_status(&mut status, Duration::from_secs(5), |s| {
        s.queued_operations == 0 && s.last_sync_time.is_some() && s.cart.quantity_of("bookX") == 3
    })
    .await;

    assert_eq!(settled.pending_operations, 0);
    assert_consistent!(settled.cart);
    assert_eq!(api.server_cart("s1").quantity_of("bookX"), 3);
    assert_eq!(api.calls(), vec!["ADD_ITEM bookX".to_string()]);
    session.shutdown().await;
}

#[tokio::test]
async fn test_clear_reaches_other_tab_without_server_round_trip() {
    let hub = BroadcastHub::new();
    let api = FakeCartApi::with_cart(cart_with("shared", &[("a", 1), ("b", 2)]));
    let store = memory_store();
    let tab_a = session_with(
        test_config("shared"),
        api.clone(),
        store.clone(),
        PlatformCapabilities::native(hub.clone()),
    );
    let tab_b = session_with(test_config("shared"), api.clone(), store, PlatformCapabilities::native(hub));
    assert_ok!(tab_a.refresh_cart().await);
    assert_ok!(tab_b.refresh_cart().await);
    assert_eq!(tab_b.cart().total_items, 3);

    let mut tab_b_status = tab_b.watch();
    let started = Instant::now();
    assert_ok!(tab_a.clear_cart().await);

    let status = wait_for_status(&mut tab_b_status, Duration::from_secs(2), |s| s.cart.is_empty()).await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(status.cart.total_price, 0);
    assert_eq!(api.calls(), vec!["CLEAR_CART *".to_string()]);

    tab_a.shutdown().await;
    tab_b.shutdown().await;
}

#[tokio::test]
async fn test_session_change_follows_other_tab() {
    let hub = BroadcastHub::new();
    let api = FakeCartApi::new();
    let tab_a = session_with(
        test_config("old"),
        api.clone(),
        memory_store(),
        PlatformCapabilities::native(hub.clone()),
    );
    let tab_b = session_with(test_config("old"), api, memory_store(), PlatformCapabilities::native(hub));

    let mut tab_b_status = tab_b.watch();
    tab_a.switch_session("new").await;
    assert_eq!(tab_a.session_id(), "new");

    let status = wait_for_status(&mut tab_b_status, Duration::from_secs(2), |s| s.session_id == "new").await;
    assert!(status.cart.is_empty());
    assert_eq!(tab_b.session_id(), "new");

    tab_a.shutdown().await;
    tab_b.shutdown().await;
}

#[tokio::test]
async fn test_recover_after_restart() {
    let store = memory_store();
    let api = FakeCartApi::new();

    let first = session_with(test_config("s1"), api.clone(), store.clone(), PlatformCapabilities::default());
    assert_ok!(first.add_to_cart("book", 2, DEFAULT_UNIT_PRICE).await);
    assert_ok!(first.add_to_cart("pen", 1, DEFAULT_UNIT_PRICE).await);
    first.shutdown().await;

    api.set_online(false);
    let second = session_with(test_config("s1"), api, store, PlatformCapabilities::default());
    assert!(second.cart().is_empty());
    let recovered = second.recover().await;

    assert_eq!(recovered.quantity_of("book"), 2);
    assert_eq!(recovered.quantity_of("pen"), 1);
    assert_consistent!(recovered);
    assert_matches!(second.refresh_cart().await, Err(CartError::Api(ApiError::Offline(_))));
    assert_eq!(second.cart(), recovered);
    second.shutdown().await;
}

#[tokio::test]
async fn test_rejection_rolls_back_only_the_failed_change() {
    let api = FakeCartApi::new();
    let session = session_with(test_config("s1"), api.clone(), memory_store(), PlatformCapabilities::default());
    assert_ok!(session.add_to_cart("book", 1, DEFAULT_UNIT_PRICE).await);

    api.reject_with(Some(409));
    let result = session.update_quantity("book", 5).await;
    assert_matches!(
        result,
        Err(CartError::Rejected {
            source: ApiError::Rejected { status: 409, .. },
            ..
        })
    );
    assert_eq!(session.cart().quantity_of("book"), 1);
    assert!(session.status().last_error.is_some());
    session.shutdown().await;
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries() {
    let config = SyncConfig::builder()
        .api_url("http://127.0.0.1:9")
        .session_id("s1")
        .optimistic(OptimisticConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
            ..OptimisticConfig::default()
        })
        .build()
        .unwrap();
    let api = FakeCartApi::new();
    api.reject_with(Some(503));
    let session = session_with(config, api.clone(), memory_store(), PlatformCapabilities::default());

    let result = session.add_to_cart("book", 1, DEFAULT_UNIT_PRICE).await;
    assert_matches!(result, Err(CartError::RetriesExhausted { retries: 2, .. }));
    assert_eq!(api.calls().len(), 3);
    assert!(session.cart().is_empty());
    assert_eq!(session.pending_operations(), 0);
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_double_up_to_the_cap() {
    let config = SyncConfig::builder()
        .api_url("http://127.0.0.1:9")
        .session_id("s1")
        .optimistic(OptimisticConfig {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(3),
            ..OptimisticConfig::default()
        })
        .build()
        .unwrap();
    let api = FakeCartApi::new();
    api.reject_with(Some(503));
    let session = session_with(config, api.clone(), memory_store(), PlatformCapabilities::default());

    let started = Instant::now();
    let result = session.add_to_cart("book", 1, DEFAULT_UNIT_PRICE).await;
    let waited = started.elapsed();

    assert_matches!(result, Err(CartError::RetriesExhausted { retries: 3, .. }));
    assert_eq!(api.calls().len(), 4);
    // 1s + 2s + 3s (capped), each with up to 10% jitter
    assert!(waited >= Duration::from_secs(6), "retried too fast: {waited:?}");
    assert!(waited < Duration::from_millis(6_700), "retried too slow: {waited:?}");
    session.shutdown().await;
}

#[tokio::test]
async fn test_pending_bound_makes_callers_wait() {
    let config = SyncConfig::builder()
        .api_url("http://127.0.0.1:9")
        .session_id("s1")
        .optimistic(OptimisticConfig {
            max_pending_operations: 1,
            ..OptimisticConfig::default()
        })
        .build()
        .unwrap();
    let api = FakeCartApi::new();
    api.set_delay(Duration::from_millis(200));
    let session = session_with(config, api.clone(), memory_store(), PlatformCapabilities::default());

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.add_to_cart("a", 1, DEFAULT_UNIT_PRICE).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = tokio::spawn({
        let session = session.clone();
        async move { session.add_to_cart("b", 1, DEFAULT_UNIT_PRICE).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.pending_operations(), 1);
    assert_eq!(session.cart().quantity_of("b"), 0);

    assert_ok!(first.await.unwrap());
    assert_ok!(second.await.unwrap());
    assert_eq!(session.cart().total_items, 2);
    assert_eq!(api.calls(), vec!["ADD_ITEM a".to_string(), "ADD_ITEM b".to_string()]);
    session.shutdown().await;
}

#[tokio::test]
async fn test_mutations_keep_issuance_order() {
    let api = FakeCartApi::new();
    api.set_delay(Duration::from_millis(20));
    let session = session_with(test_config("s1"), api.clone(), memory_store(), PlatformCapabilities::default());

    let add = session.add_to_cart("book", 3, DEFAULT_UNIT_PRICE);
    let update = session.update_quantity("book", 1);
    let (added, updated) = tokio::join!(add, update);
    assert_ok!(added);
    assert_ok!(updated);

    assert_eq!(api.calls(), vec!["ADD_ITEM book".to_string(), "UPDATE_QUANTITY book".to_string()]);
    assert_eq!(api.server_cart("s1").quantity_of("book"), 1);
    assert_eq!(session.cart().quantity_of("book"), 1);
    session.shutdown().await;
}

#[tokio::test]
async fn test_online_change_waits_for_earlier_offline_change() {
    let api = FakeCartApi::new();
    let session = session_with(test_config("s1"), api.clone(), memory_store(), PlatformCapabilities::default());

    api.set_online(false);
    let added = assert_ok!(session.add_to_cart("book", 1, DEFAULT_UNIT_PRICE).await);
    assert!(added.is_queued());

    // The host has not reported the network back yet
    api.set_online(true);
    let removed = assert_ok!(session.remove_from_cart("book").await);

    assert!(!removed.is_queued());
    assert_eq!(removed.cart().quantity_of("book"), 0);
    assert_eq!(api.calls(), vec!["ADD_ITEM book".to_string(), "REMOVE_ITEM book".to_string()]);
    assert_eq!(api.server_cart("s1").quantity_of("book"), 0);
    assert_eq!(session.queued_operations(), 0);
    assert_eq!(session.cart().quantity_of("book"), 0);
    session.shutdown().await;
}

#[tokio::test]
async fn test_changes_queue_behind_undelivered_offline_changes() {
    let api = FakeCartApi::with_cart(cart_with("s1", &[("book", 2)]));
    let session = session_with(test_config("s1"), api.clone(), memory_store(), PlatformCapabilities::default());
    assert_ok!(session.refresh_cart().await);

    api.set_online(false);
    assert!(assert_ok!(session.add_to_cart("book", 1, DEFAULT_UNIT_PRICE).await).is_queued());
    let removed = assert_ok!(session.remove_from_cart("book").await);
    assert!(removed.is_queued());
    assert_eq!(removed.cart().quantity_of("book"), 0);
    assert_eq!(session.queued_operations(), 2);
    assert_eq!(session.pending_operations(), 0);

    api.set_online(true);
    let results = session.force_sync().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(api.calls(), vec!["ADD_ITEM book".to_string(), "REMOVE_ITEM book".to_string()]);
    assert_eq!(api.server_cart("s1").quantity_of("book"), 0);
    assert_eq!(session.cart().quantity_of("book"), 0);
    assert_consistent!(session.cart());
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_change_rolls_back_after_timeout() {
    let api = FakeCartApi::new();
    let session = session_with(test_config("s1"), api.clone(), memory_store(), PlatformCapabilities::default());
    assert_ok!(session.add_to_cart("book", 1, DEFAULT_UNIT_PRICE).await);

    api.set_delay(Duration::from_secs(60));
    let started = Instant::now();
    let result = session.add_to_cart("pen", 1, DEFAULT_UNIT_PRICE).await;

    assert_matches!(
        result,
        Err(CartError::Rejected {
            source: ApiError::Timeout,
            ..
        })
    );
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(30), "gave up after {waited:?}");
    assert!(waited < Duration::from_secs(60), "waited for the server: {waited:?}");
    assert_eq!(session.cart().quantity_of("pen"), 0);
    assert_eq!(session.cart().quantity_of("book"), 1);
    assert_eq!(session.pending_operations(), 0);
    // Timed out requests are not resent
    assert_eq!(api.calls(), vec!["ADD_ITEM book".to_string()]);
    session.shutdown().await;
}
