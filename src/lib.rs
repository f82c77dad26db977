//! cartsync - Cart Synchronization Engine
//!
//! Keeps a shopping cart consistent between a remote Cart API, several
//! concurrent client replicas of the same session, and local durable storage,
//! while the network comes and goes.
//!
//! # Module Structure
//!
//! - **`shared`** - cart model, mutations, wire messages, errors, configuration
//! - **`storage`** - durable key/value stores (in-memory and SQLite)
//! - **`api`** - remote Cart API contract and its HTTP client
//! - **`offline`** - optimistic mutations, offline queue, retry policy,
//!   snapshot merge
//! - **`snapshot`** - checksummed cart snapshots and recovery
//! - **`broadcast`** - cross-replica messaging over a native hub or storage
//!   events
//! - **`realtime`** - WebSocket transport with an event-stream fallback
//! - **`session`** - the controller the presentation layer uses
//!
//! # Error Handling
//!
//! Each layer absorbs its own failures. Only mutation failures reach the
//! caller, as [`shared::CartError`]; a mutation deferred while offline is a
//! successful [`session::MutationOutcome::Queued`].

/// Shared types and data structures
pub mod shared;

/// Durable local storage
pub mod storage;

/// Remote Cart API
pub mod api;

/// Optimistic updates and offline support
pub mod offline;

/// Cart snapshots
pub mod snapshot;

/// Cross-replica broadcast
pub mod broadcast;

/// Realtime push transports
pub mod realtime;

/// Cart session controller
pub mod session;
