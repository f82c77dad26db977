//! Broadcast emulation over shared durable storage.
//!
//! Replicas append messages to one log key and react to the store's change
//! notifications by reading the log back and delivering entries they have
//! not seen yet. The log is capped at `storage_log_limit` entries and a
//! background task periodically drops entries older than the staleness
//! window.

use super::{BackendKind, BroadcastMessage, ChannelBackend};
use crate::shared::config::BroadcastConfig;
use crate::shared::error::{BroadcastError, PersistenceError};
use crate::storage::{read_json, write_json, KeyValueStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Storage key prefix of message logs, followed by the channel name
pub const BROADCAST_LOG_PREFIX: &str = "cart_broadcast:";

const DELIVERY_CAPACITY: usize = 256;

/// Bounded set of message ids already delivered or posted
#[derive(Debug)]
struct SeenIds {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns `true` when the id was not seen before
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

#[derive(Debug)]
struct Shared {
    store: Arc<dyn KeyValueStore>,
    key: String,
    log_limit: usize,
    staleness_window: Duration,
    sender: broadcast::Sender<BroadcastMessage>,
    seen: Mutex<SeenIds>,
    // Serializes this replica's read-modify-write cycles on the log
    write_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn read_log(&self) -> Result<Vec<BroadcastMessage>, PersistenceError> {
        Ok(read_json(self.store.as_ref(), &self.key).await?.unwrap_or_default())
    }

    async fn deliver_new(&self) {
        let log = match self.read_log().await {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to read broadcast log");
                return;
            }
        };
        for message in log {
            if self.seen.lock().insert(message.id) {
                let _ = self.sender.send(message);
            }
        }
    }

    async fn append(&self, message: &BroadcastMessage) -> Result<(), BroadcastError> {
        let _guard = self.write_lock.lock().await;
        let mut log = self.read_log().await?;
        log.push(message.clone());
        if log.len() > self.log_limit {
            let excess = log.len() - self.log_limit;
            log.drain(..excess);
        }
        // Mark before writing so our own change notification is not delivered back
        self.seen.lock().insert(message.id);
        write_json(self.store.as_ref(), &self.key, &log).await?;
        Ok(())
    }

    async fn trim(&self) -> Result<usize, PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let mut log = self.read_log().await?;
        let before = log.len();
        log.retain(|message| message.age() <= self.staleness_window);
        let removed = before - log.len();
        if removed > 0 {
            if log.is_empty() {
                self.store.remove(&self.key).await?;
            } else {
                write_json(self.store.as_ref(), &self.key, &log).await?;
            }
        }
        Ok(removed)
    }
}

/// Storage-event backed channel
#[derive(Debug)]
pub struct StorageEventChannel {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl StorageEventChannel {
    /// Open the log for `config.channel_name` and start the listener and
    /// trim tasks. Must be called inside a tokio runtime.
    pub fn open(store: Arc<dyn KeyValueStore>, config: &BroadcastConfig) -> Self {
        let shared = Arc::new(Shared {
            key: format!("{}{}", BROADCAST_LOG_PREFIX, config.channel_name),
            log_limit: config.storage_log_limit.max(1),
            staleness_window: config.staleness_window,
            sender: broadcast::channel(DELIVERY_CAPACITY).0,
            seen: Mutex::new(SeenIds::new(config.storage_log_limit.max(1) * 4)),
            write_lock: tokio::sync::Mutex::new(()),
            store,
        });
        let cancel = CancellationToken::new();

        tokio::spawn(listen(Arc::clone(&shared), cancel.child_token()));
        tokio::spawn(trim_periodically(
            Arc::clone(&shared),
            config.trim_interval,
            cancel.child_token(),
        ));

        Self { shared, cancel }
    }

    /// Drop log entries older than the staleness window now
    pub async fn trim(&self) -> Result<usize, PersistenceError> {
        self.shared.trim().await
    }
}

impl Drop for StorageEventChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn listen(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut events = shared.store.watch();
    // Entries already in the log predate this replica
    if let Ok(log) = shared.read_log().await {
        let mut seen = shared.seen.lock();
        for message in log {
            seen.insert(message.id);
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) if event.key == shared.key && !event.removed => shared.deliver_new().await,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Storage notifications lagged, rereading broadcast log");
                    shared.deliver_new().await;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!(key = %shared.key, "Storage broadcast listener stopped");
}

async fn trim_periodically(shared: Arc<Shared>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match shared.trim().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "Trimmed broadcast log"),
                    Err(e) => tracing::warn!(error = %e, "Failed to trim broadcast log"),
                }
            }
        }
    }
}

#[async_trait]
impl ChannelBackend for StorageEventChannel {
    fn kind(&self) -> BackendKind {
        BackendKind::StorageEvents
    }

    async fn post(&self, message: &BroadcastMessage) -> Result<(), BroadcastError> {
        if self.cancel.is_cancelled() {
            return Err(BroadcastError::Closed);
        }
        self.shared.append(message).await
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.shared.sender.subscribe()
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}
