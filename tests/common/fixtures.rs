//! Session and cart fixtures

use super::fake_api::{FakeCartApi, DEFAULT_UNIT_PRICE};
use cartsync::broadcast::PlatformCapabilities;
use cartsync::session::{CartSession, SessionParts, SyncStatus};
use cartsync::shared::{Cart, CartItem, SyncConfig};
use cartsync::storage::{KeyValueStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cart with `(product, quantity)` lines at the default unit price
pub fn cart_with(session_id: &str, lines: &[(&str, u32)]) -> Cart {
    let items = lines
        .iter()
        .map(|(product, quantity)| CartItem::new(*product, *quantity, DEFAULT_UNIT_PRICE))
        .collect();
    Cart::with_items(session_id, items)
}

pub fn test_config(session_id: &str) -> SyncConfig {
    SyncConfig::builder()
        .api_url("http://127.0.0.1:9")
        .session_id(session_id)
        .build()
        .unwrap()
}

pub fn memory_store() -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryStore::new())
}

/// Session without realtime transports
pub fn session_with(
    config: SyncConfig,
    api: Arc<FakeCartApi>,
    store: Arc<dyn KeyValueStore>,
    capabilities: PlatformCapabilities,
) -> CartSession {
    let parts = SessionParts {
        api,
        store,
        capabilities,
        transport: None,
        fallback: None,
    };
    CartSession::new(config, parts).unwrap()
}

/// Wait until the status satisfies `predicate`, panicking after `limit`
pub async fn wait_for_status<F>(status: &mut watch::Receiver<SyncStatus>, limit: Duration, predicate: F) -> SyncStatus
where
    F: Fn(&SyncStatus) -> bool,
{
    let result = tokio::time::timeout(limit, async {
        loop {
            {
                let current = status.borrow_and_update();
                if predicate(&current) {
                    return current.clone();
                }
            }
            if status.changed().await.is_err() {
                panic!("status channel closed");
            }
        }
    })
    .await;
    match result {
        Ok(status) => status,
        Err(_) => panic!("status condition not reached within {limit:?}: {:?}", status.borrow()),
    }
}
