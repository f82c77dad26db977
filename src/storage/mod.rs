//! # Durable Local Storage
//!
//! Key/value byte storage used for cart snapshots, the offline queue and the
//! storage-backed cross-replica message log.
//!
//! ## Architecture
//!
//! - `KeyValueStore`: the storage contract
//! - `memory.rs`: in-process store with an optional byte quota
//! - `sqlite.rs`: SQLite-backed store surviving restarts
//!
//! Every store publishes a [`StorageEvent`] after each successful write or
//! removal, which is what the storage-event broadcast emulation listens to.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cartsync::storage::{KeyValueStore, MemoryStore, read_json, write_json};
//!
//! # async fn example() -> Result<(), cartsync::shared::PersistenceError> {
//! let store = MemoryStore::new();
//! write_json(&store, "greeting", &"hello").await?;
//! let value: Option<String> = read_json(&store, "greeting").await?;
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::shared::error::PersistenceError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the change notification channel of every store
pub(crate) const STORAGE_EVENT_CAPACITY: usize = 256;

/// Change notification for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Key that was written or removed
    pub key: String,
    /// Whether the key still exists
    pub removed: bool,
}

/// Durable key/value byte store
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), PersistenceError>;

    /// Delete a value; deleting a missing key is not an error
    async fn remove(&self, key: &str) -> Result<(), PersistenceError>;

    /// Keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, PersistenceError>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<StorageEvent>;
}

/// Read and decode a JSON value
pub async fn read_json<T>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>, PersistenceError>
where
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub async fn write_json<T>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), PersistenceError>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes).await
}
