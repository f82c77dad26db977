//! Durability across restarts on the SQLite store

use crate::common::*;
use crate::{assert_consistent, assert_ok};
use assert_matches::assert_matches;
use cartsync::broadcast::PlatformCapabilities;
use cartsync::offline::queue::ops_key;
use cartsync::offline::{OfflineOperation, OfflineQueue, ReplayOutcome};
use cartsync::session::NetworkStatus;
use cartsync::shared::config::{OfflineConfig, SnapshotConfig};
use cartsync::shared::CartMutation;
use cartsync::snapshot::{snapshot_key, Snapshot, SnapshotStore};
use cartsync::storage::{read_json, write_json, KeyValueStore, SqliteStore};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn open(path: &Path) -> Arc<dyn KeyValueStore> {
    Arc::new(SqliteStore::open(path).await.unwrap())
}

fn add(product: &str, quantity: u32) -> CartMutation {
    CartMutation::AddItem {
        product_id: product.to_string(),
        quantity,
        unit_price: DEFAULT_UNIT_PRICE,
    }
}

#[tokio::test]
async fn test_queue_survives_restart_and_replays_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cart.db");
    let api = FakeCartApi::new();
    let id = Uuid::new_v4();

    {
        let queue = OfflineQueue::new(open(&path).await, api.clone(), "s1", OfflineConfig::default());
        assert!(assert_ok!(queue.queue_operation(id, add("book", 1)).await));
    }

    let queue = OfflineQueue::new(open(&path).await, api.clone(), "s1", OfflineConfig::default());
    assert_eq!(queue.get_pending_count().await, 1);

    let results = queue.force_sync().await;
    assert_eq!(results.len(), 1);
    assert_matches!(&results[0].outcome, ReplayOutcome::Applied(cart) if cart.quantity_of("book") == 1);

    assert!(queue.force_sync().await.is_empty());
    assert!(!assert_ok!(queue.queue_operation(id, add("book", 1)).await));
    assert_eq!(api.server_cart("s1").quantity_of("book"), 1);
}

#[tokio::test]
async fn test_operation_marked_applied_is_not_sent_again() {
    let store = memory_store();
    let api = FakeCartApi::new();
    let queue = OfflineQueue::new(Arc::clone(&store), api.clone(), "s1", OfflineConfig::default());
    let id = Uuid::new_v4();
    assert_ok!(queue.queue_operation(id, add("book", 2)).await);

    // Crash after the server applied it, before the record was removed
    let mut stored: Vec<OfflineOperation> = read_json(store.as_ref(), &ops_key("s1")).await.unwrap().unwrap();
    stored[0].applied = true;
    write_json(store.as_ref(), &ops_key("s1"), &stored).await.unwrap();

    let results = queue.force_sync().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].operation_id, id);
    assert_eq!(results[0].outcome, ReplayOutcome::Skipped);
    assert!(api.calls().is_empty());
    assert_eq!(queue.get_pending_count().await, 0);
}

#[tokio::test]
async fn test_snapshot_round_trip_and_tamper_detection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cart.db");
    let cart = cart_with("s1", &[("book", 2), ("pen", 3)]);

    {
        let snapshots = SnapshotStore::new(open(&path).await, SnapshotConfig::default());
        assert!(snapshots.save_snapshot(&cart).await.is_some());
    }

    let store = open(&path).await;
    let snapshots = SnapshotStore::new(Arc::clone(&store), SnapshotConfig::default());
    assert_eq!(snapshots.load_latest_snapshot("s1").await, Some(cart.clone()));

    let mut stored: Vec<Snapshot> = read_json(store.as_ref(), &snapshot_key("s1")).await.unwrap().unwrap();
    stored[0].cart.items[0].quantity = 20;
    write_json(store.as_ref(), &snapshot_key("s1"), &stored).await.unwrap();
    assert_eq!(snapshots.load_latest_snapshot("s1").await, None);
}

#[tokio::test]
async fn test_session_restart_keeps_queued_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cart.db");
    let api = FakeCartApi::with_cart(cart_with("s1", &[("bookX", 2)]));

    {
        let session = session_with(test_config("s1"), api.clone(), open(&path).await, PlatformCapabilities::default());
        assert_ok!(session.refresh_cart().await);
        api.set_online(false);
        let outcome = assert_ok!(session.add_to_cart("bookX", 1, DEFAULT_UNIT_PRICE).await);
        assert!(outcome.is_queued());
        session.shutdown().await;
    }

    let session = session_with(test_config("s1"), api.clone(), open(&path).await, PlatformCapabilities::default());
    let recovered = session.recover().await;
    assert_eq!(recovered.quantity_of("bookX"), 3);
    assert_eq!(session.queued_operations(), 1);
    assert_consistent!(recovered);

    api.set_online(true);
    let mut status = session.watch();
    session.set_network_status(NetworkStatus::Offline);
    session.set_network_status(NetworkStatus::Online);
    let settled = wait_for_status(&mut status, Duration::from_secs(5), |s| {
        s.queued_operations == 0 && s.last_sync_time.is_some()
    })
    .await;

    assert_eq!(settled.cart.quantity_of("bookX"), 3);
    assert_eq!(api.server_cart("s1").quantity_of("bookX"), 3);
    session.shutdown().await;
}
