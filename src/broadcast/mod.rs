//! # Cross-Replica Broadcast
//!
//! Propagates cart changes between replicas (open clients) of one browsing
//! session.
//!
//! ## Architecture
//!
//! - `ChannelBackend`: post/subscribe contract every transport satisfies
//! - `native.rs`: named in-process broadcast channels shared through a
//!   [`BroadcastHub`]
//! - `storage.rs`: emulation over a shared [`KeyValueStore`] log plus its
//!   change notifications
//! - `noop.rs`: used when neither is available
//! - `replica.rs`: [`CrossReplicaBroadcast`], which debounces outbound
//!   messages, filters stale and self-originated inbound ones and dispatches
//!   them to registered handlers
//!
//! [`create_backend`] picks the backend from [`PlatformCapabilities`], so
//! callers never depend on which one is in use.

pub mod debounce;
pub mod message;
pub mod native;
pub mod noop;
pub mod replica;
pub mod storage;

pub use debounce::Debouncer;
pub use message::{BroadcastKind, BroadcastMessage, BroadcastPayload};
pub use native::{BroadcastHub, NativeChannel};
pub use noop::NoopChannel;
pub use replica::CrossReplicaBroadcast;
pub use storage::StorageEventChannel;

use crate::shared::config::BroadcastConfig;
use crate::shared::error::BroadcastError;
use crate::storage::KeyValueStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Which backend carries the messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Native,
    StorageEvents,
    Noop,
}

/// Transport for broadcast messages between replicas
#[async_trait]
pub trait ChannelBackend: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Deliver a message to the other replicas
    async fn post(&self, message: &BroadcastMessage) -> Result<(), BroadcastError>;

    /// Messages posted by other replicas, in arrival order
    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage>;

    async fn close(&self);
}

/// Broadcast primitives available on the running platform
#[derive(Debug, Clone, Default)]
pub struct PlatformCapabilities {
    pub hub: Option<BroadcastHub>,
    pub storage: Option<Arc<dyn KeyValueStore>>,
}

impl PlatformCapabilities {
    pub fn native(hub: BroadcastHub) -> Self {
        Self {
            hub: Some(hub),
            storage: None,
        }
    }

    pub fn storage(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            hub: None,
            storage: Some(store),
        }
    }
}

/// Pick the best available backend: native channel, then storage events,
/// then no-op
pub fn create_backend(capabilities: &PlatformCapabilities, config: &BroadcastConfig) -> Arc<dyn ChannelBackend> {
    let backend: Arc<dyn ChannelBackend> = match (&capabilities.hub, &capabilities.storage) {
        (Some(hub), _) => Arc::new(hub.open(&config.channel_name)),
        (None, Some(store)) => Arc::new(StorageEventChannel::open(Arc::clone(store), config)),
        (None, None) => Arc::new(NoopChannel::new()),
    };
    tracing::debug!(kind = ?backend.kind(), channel = %config.channel_name, "Selected broadcast backend");
    backend
}
