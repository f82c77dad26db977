//! In-process key/value store.
//!
//! Shared between replicas of the same process by cloning; an optional byte
//! quota reproduces the "storage full" condition of real browser storage.

use super::{KeyValueStore, StorageEvent, STORAGE_EVENT_CAPACITY};
use crate::shared::error::PersistenceError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug)]
struct Inner {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    quota: Option<usize>,
    events: broadcast::Sender<StorageEvent>,
}

/// Memory-backed store; clones share the same entries
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a store holding at most `bytes` bytes of keys and values
    pub fn with_quota(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(quota: Option<usize>) -> Self {
        let (events, _) = broadcast::channel(STORAGE_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(BTreeMap::new()),
                quota,
                events,
            }),
        }
    }

    /// Bytes currently used by keys and values
    pub fn used_bytes(&self) -> usize {
        let entries = self.inner.entries.lock();
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn notify(&self, key: &str, removed: bool) {
        // No subscribers is fine.
        let _ = self.inner.events.send(StorageEvent {
            key: key.to_string(),
            removed,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.inner.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), PersistenceError> {
        {
            let mut entries = self.inner.entries.lock();
            if let Some(quota) = self.inner.quota {
                let used: usize = entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                let needed = key.len() + value.len();
                if used + needed > quota {
                    return Err(PersistenceError::QuotaExceeded {
                        needed,
                        available: quota.saturating_sub(used),
                    });
                }
            }
            entries.insert(key.to_string(), value);
        }
        self.notify(key, false);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let existed = self.inner.entries.lock().remove(key).is_some();
        if existed {
            self.notify(key, true);
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let entries = self.inner.entries.lock();
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.events.subscribe()
    }
}
