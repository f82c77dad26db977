//! # Offline Operation Queue
//!
//! Durable FIFO of mutations that failed because the client was offline.
//!
//! ## Features
//!
//! - **Persistent queue**: operations are stored per session and survive
//!   restarts
//! - **Strict ordering**: replay walks the queue in submission order and stops
//!   at the first operation that cannot be applied yet
//! - **Idempotent replay**: applied operation ids are recorded in a bounded
//!   ledger, so an operation seen twice (for instance after a crash between
//!   apply and removal) is skipped instead of applied again
//! - **Bounded retries**: an operation rejected more than `max_retries` times
//!   is dropped and reported through [`QueueEvent::OperationDropped`]
//!
//! ## State machine
//!
//! ```text
//! Queued -> Replaying -> Applied
//!                     -> RetryQueued -> Replaying ...
//!                     -> Failed (terminal)
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cartsync::offline::OfflineQueue;
//! # use std::sync::Arc;
//! # async fn example(queue: Arc<OfflineQueue>, mutation: cartsync::shared::CartMutation) {
//! queue.queue_operation(uuid::Uuid::new_v4(), mutation).await.ok();
//! if queue.set_online(true) {
//!     let results = queue.force_sync().await;
//!     println!("replayed {} operations", results.len());
//! }
//! # }
//! ```

use crate::api::CartApi;
use crate::shared::cart::Cart;
use crate::shared::config::OfflineConfig;
use crate::shared::error::{ApiError, PersistenceError};
use crate::shared::mutation::CartMutation;
use crate::storage::{read_json, write_json, KeyValueStore};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use uuid::Uuid;

/// Storage key prefix of queued operations, followed by the session id
pub const OFFLINE_OPS_PREFIX: &str = "cart_offline_ops:";
/// Storage key prefix of the applied-id ledger, followed by the session id
pub const APPLIED_LEDGER_PREFIX: &str = "cart_offline_applied:";

const QUEUE_EVENT_CAPACITY: usize = 64;

pub fn ops_key(session_id: &str) -> String {
    format!("{}{}", OFFLINE_OPS_PREFIX, session_id)
}

pub fn ledger_key(session_id: &str) -> String {
    format!("{}{}", APPLIED_LEDGER_PREFIX, session_id)
}

/// Replay state of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueuedState {
    Queued,
    Replaying,
    Applied,
    RetryQueued,
    Failed,
}

/// A mutation deferred while offline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineOperation {
    /// Same id the optimistic manager used for the mutation
    pub id: Uuid,
    pub session_id: String,
    pub mutation: CartMutation,
    pub queued_at: DateTime<Utc>,
    pub retries: u32,
    pub max_retries: u32,
    pub applied: bool,
    pub state: QueuedState,
}

/// What happened to one operation during a replay pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The server accepted it and returned this cart
    Applied(Cart),
    /// Already applied earlier; removed without calling the server
    Skipped,
    /// Still offline; the pass stopped here
    Deferred(ApiError),
    /// Rejected with retries left; the pass stopped here
    RetryQueued(ApiError),
    /// Rejected with no retries left; dropped from the queue
    Failed(ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResult {
    pub operation_id: Uuid,
    pub outcome: ReplayOutcome,
}

impl ReplayResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ReplayOutcome::Applied(_) | ReplayOutcome::Skipped)
    }

    /// Authoritative cart returned by the server, if any
    pub fn cart(&self) -> Option<&Cart> {
        match &self.outcome {
            ReplayOutcome::Applied(cart) => Some(cart),
            _ => None,
        }
    }
}

/// Notifications published by the queue
#[derive(Debug, Clone)]
pub enum QueueEvent {
    NetworkChanged { online: bool },
    SyncCompleted { results: Vec<ReplayResult> },
    OperationDropped { operation: OfflineOperation, error: ApiError },
}

/// Durable offline operation queue for one session at a time
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    api: Arc<dyn CartApi>,
    config: OfflineConfig,
    session_id: RwLock<String>,
    online: AtomicBool,
    sync_in_progress: AtomicBool,
    sync_lock: Mutex<()>,
    events: broadcast::Sender<QueueEvent>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("session_id", &*self.session_id.read())
            .field("online", &self.is_online())
            .field("sync_in_progress", &self.is_sync_in_progress())
            .finish()
    }
}

/// Clears the in-progress flag when a replay pass ends
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfflineQueue {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn CartApi>,
        session_id: impl Into<String>,
        config: OfflineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(QUEUE_EVENT_CAPACITY);
        Self {
            store,
            api,
            config,
            session_id: RwLock::new(session_id.into()),
            online: AtomicBool::new(true),
            sync_in_progress: AtomicBool::new(false),
            sync_lock: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    /// Point the queue at another session's records
    pub fn set_session(&self, session_id: impl Into<String>) {
        *self.session_id.write() = session_id.into();
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.sync_in_progress.load(Ordering::SeqCst)
    }

    /// Record connectivity. Returns `true` on an offline to online
    /// transition, which is when the caller should replay.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return false;
        }
        tracing::info!(online, "Network status changed");
        let _ = self.events.send(QueueEvent::NetworkChanged { online });
        online
    }

    /// Append a mutation to the durable queue.
    ///
    /// Returns `false` without queueing when the id was already applied or is
    /// already queued.
    pub async fn queue_operation(&self, id: Uuid, mutation: CartMutation) -> Result<bool, PersistenceError> {
        // A replay pass rewrites the whole record
        let _lock = self.sync_lock.lock().await;
        let session_id = self.session_id();
        let ledger = self.load_ledger(&session_id).await?;
        if ledger.contains(&id) {
            tracing::debug!(operation_id = %id, "Operation already applied, not queueing");
            return Ok(false);
        }

        let mut operations = self.load_operations(&session_id).await?;
        if operations.iter().any(|op| op.id == id) {
            return Ok(false);
        }

        operations.push(OfflineOperation {
            id,
            session_id: session_id.clone(),
            mutation,
            queued_at: Utc::now(),
            retries: 0,
            max_retries: self.config.max_retries,
            applied: false,
            state: QueuedState::Queued,
        });
        self.save_operations(&session_id, &operations).await?;

        tracing::info!(
            operation_id = %id,
            session_id = %session_id,
            queued = operations.len(),
            "Queued operation for offline replay"
        );
        Ok(true)
    }

    /// Operations not yet applied, in replay order
    pub async fn pending_operations(&self) -> Result<Vec<OfflineOperation>, PersistenceError> {
        let operations = self.load_operations(&self.session_id()).await?;
        Ok(operations.into_iter().filter(|op| !op.applied).collect())
    }

    pub async fn get_pending_count(&self) -> usize {
        match self.pending_operations().await {
            Ok(operations) => operations.len(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read offline queue");
                0
            }
        }
    }

    /// Replay the queue now.
    ///
    /// Returns an empty list when another replay is already running or the
    /// queue could not be read.
    pub async fn force_sync(&self) -> Vec<ReplayResult> {
        let Ok(lock) = self.sync_lock.try_lock() else {
            tracing::debug!("Offline replay already in progress");
            return Vec::new();
        };
        self.replay_pass(lock).await
    }

    /// Replay the queue, waiting for a running pass to finish first
    pub async fn sync(&self) -> Vec<ReplayResult> {
        let lock = self.sync_lock.lock().await;
        self.replay_pass(lock).await
    }

    async fn replay_pass(&self, _lock: MutexGuard<'_, ()>) -> Vec<ReplayResult> {
        self.sync_in_progress.store(true, Ordering::SeqCst);
        let _guard = SyncGuard(&self.sync_in_progress);

        let session_id = self.session_id();
        let results = match self.replay(&session_id).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, session_id = %session_id, "Offline replay aborted");
                Vec::new()
            }
        };

        if !results.is_empty() {
            let applied = results.iter().filter(|r| r.is_success()).count();
            tracing::info!(
                session_id = %session_id,
                applied,
                total = results.len(),
                "Offline replay finished"
            );
            let _ = self.events.send(QueueEvent::SyncCompleted {
                results: results.clone(),
            });
        }
        results
    }

    async fn replay(&self, session_id: &str) -> Result<Vec<ReplayResult>, PersistenceError> {
        let mut operations = self.load_operations(session_id).await?;
        let mut ledger = self.load_ledger(session_id).await?;
        let mut results = Vec::new();

        while let Some(front) = operations.first_mut() {
            let operation_id = front.id;

            if front.applied || ledger.contains(&operation_id) {
                operations.remove(0);
                self.save_operations(session_id, &operations).await?;
                results.push(ReplayResult {
                    operation_id,
                    outcome: ReplayOutcome::Skipped,
                });
                continue;
            }

            front.state = QueuedState::Replaying;
            tracing::debug!(%operation_id, kind = %front.mutation.kind(), "Replaying offline operation");

            match self.api.execute(session_id, &front.mutation).await {
                Ok(cart) => {
                    front.applied = true;
                    front.state = QueuedState::Applied;
                    let recorded = self
                        .finish_applied(session_id, &mut operations, &mut ledger, operation_id)
                        .await;
                    results.push(ReplayResult {
                        operation_id,
                        outcome: ReplayOutcome::Applied(cart),
                    });
                    // The server result stands even if the bookkeeping failed
                    if let Err(e) = recorded {
                        tracing::warn!(%operation_id, error = %e, "Could not record applied operation, stopping replay");
                        break;
                    }
                }
                Err(error) if error.is_connectivity() => {
                    front.state = QueuedState::Queued;
                    self.online.store(false, Ordering::SeqCst);
                    results.push(ReplayResult {
                        operation_id,
                        outcome: ReplayOutcome::Deferred(error),
                    });
                    break;
                }
                Err(error) => {
                    front.retries += 1;
                    if front.retries <= front.max_retries {
                        front.state = QueuedState::RetryQueued;
                        tracing::warn!(
                            %operation_id,
                            retries = front.retries,
                            error = %error,
                            "Offline operation failed, will retry"
                        );
                        self.save_operations(session_id, &operations).await?;
                        results.push(ReplayResult {
                            operation_id,
                            outcome: ReplayOutcome::RetryQueued(error),
                        });
                        break;
                    }

                    let mut dropped = operations.remove(0);
                    dropped.state = QueuedState::Failed;
                    self.save_operations(session_id, &operations).await?;
                    tracing::error!(
                        %operation_id,
                        retries = dropped.retries,
                        error = %error,
                        "Dropping offline operation"
                    );
                    let _ = self.events.send(QueueEvent::OperationDropped {
                        operation: dropped,
                        error: error.clone(),
                    });
                    results.push(ReplayResult {
                        operation_id,
                        outcome: ReplayOutcome::Failed(error),
                    });
                }
            }
        }

        Ok(results)
    }

    /// Persist the applied flag, then the ledger, then remove the record, so
    /// a crash in between cannot apply the operation twice
    async fn finish_applied(
        &self,
        session_id: &str,
        operations: &mut Vec<OfflineOperation>,
        ledger: &mut VecDeque<Uuid>,
        operation_id: Uuid,
    ) -> Result<(), PersistenceError> {
        self.save_operations(session_id, operations).await?;
        self.record_applied(session_id, ledger, operation_id).await?;
        operations.remove(0);
        self.save_operations(session_id, operations).await
    }

    async fn record_applied(
        &self,
        session_id: &str,
        ledger: &mut VecDeque<Uuid>,
        operation_id: Uuid,
    ) -> Result<(), PersistenceError> {
        ledger.push_back(operation_id);
        while ledger.len() > self.config.applied_ledger_size {
            ledger.pop_front();
        }
        write_json(self.store.as_ref(), &ledger_key(session_id), &*ledger).await
    }

    async fn load_operations(&self, session_id: &str) -> Result<Vec<OfflineOperation>, PersistenceError> {
        Ok(read_json(self.store.as_ref(), &ops_key(session_id))
            .await?
            .unwrap_or_default())
    }

    async fn save_operations(&self, session_id: &str, operations: &[OfflineOperation]) -> Result<(), PersistenceError> {
        let key = ops_key(session_id);
        if operations.is_empty() {
            self.store.remove(&key).await
        } else {
            write_json(self.store.as_ref(), &key, operations).await
        }
    }

    async fn load_ledger(&self, session_id: &str) -> Result<VecDeque<Uuid>, PersistenceError> {
        Ok(read_json(self.store.as_ref(), &ledger_key(session_id))
            .await?
            .unwrap_or_default())
    }
}

/// Remove the queue and ledger of a session
pub async fn clear_session_records(store: &dyn KeyValueStore, session_id: &str) -> Result<(), PersistenceError> {
    store.remove(&ops_key(session_id)).await?;
    store.remove(&ledger_key(session_id)).await
}

/// Drop queued operations older than `max_age` across every session.
/// Returns how many were removed.
pub async fn purge_expired_records(store: &dyn KeyValueStore, max_age: Duration) -> Result<usize, PersistenceError> {
    let Some(cutoff) = chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
    else {
        return Ok(0);
    };
    let mut removed = 0;

    for key in store.keys(OFFLINE_OPS_PREFIX).await? {
        let operations: Vec<OfflineOperation> = match read_json(store, &key).await {
            Ok(Some(operations)) => operations,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Removing unreadable offline queue");
                store.remove(&key).await?;
                continue;
            }
        };

        let before = operations.len();
        let kept: Vec<_> = operations.into_iter().filter(|op| op.queued_at >= cutoff).collect();
        if kept.len() == before {
            continue;
        }
        removed += before - kept.len();
        if kept.is_empty() {
            store.remove(&key).await?;
        } else {
            write_json(store, &key, &kept).await?;
        }
    }

    Ok(removed)
}
