//! # Offline-First Cart State
//!
//! Optimistic updates, deferred replay and state reconciliation.
//!
//! ## Architecture
//!
//! - **Optimistic manager**: applies mutations immediately and rebuilds the
//!   effective cart from the authoritative state plus the pending operations
//! - **Offline queue**: durable FIFO of mutations issued without connectivity,
//!   replayed once the network returns
//! - **Reconciliation**: merges two divergent carts
//! - **Retry**: delay schedules for reconnection and transient failures
//!
//! ## Key Components
//!
//! - `optimistic.rs`: optimistic update management
//! - `queue.rs`: offline operation queue
//! - `retry.rs`: retry policy and backoff strategies
//! - `reconciliation.rs`: merge strategies

pub mod optimistic;
pub mod queue;
pub mod reconciliation;
pub mod retry;

pub use optimistic::{AppliedUpdate, OperationStatus, OptimisticManager, PendingOperation, Rollback};
pub use queue::{OfflineOperation, OfflineQueue, QueueEvent, QueuedState, ReplayOutcome, ReplayResult};
pub use reconciliation::{reconcile, ItemConflict, MergeStrategy, ReconciliationResult};
pub use retry::{BackoffStrategy, RetryPolicy, RetryState};
