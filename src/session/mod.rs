//! # Cart Session
//!
//! The controller the presentation layer talks to. It owns the session id and
//! composes the other components:
//!
//! - **Optimistic manager**: mutations show up immediately and are confirmed
//!   or rolled back by a single worker task that calls the Cart API in
//!   issuance order
//! - **Offline queue**: mutations that failed for lack of connectivity are
//!   persisted and replayed when the network comes back
//! - **Snapshot store**: every confirmed state is snapshotted for recovery
//! - **Cross-replica broadcast**: confirmed changes are announced to other
//!   replicas of the same session, whose messages update our cart in turn
//! - **Realtime transport**: server pushes replace the authoritative cart;
//!   after repeated failures the duplex transport is swapped for the fallback
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cartsync::session::{CartSession, MutationOutcome, SessionParts};
//! use cartsync::shared::SyncConfig;
//! use cartsync::storage::{KeyValueStore, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::from_env()?;
//! let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
//! let session = CartSession::new(config.clone(), SessionParts::from_config(&config, store)?)?;
//!
//! session.recover().await;
//! match session.add_to_cart("book-x", 1, 1_999).await? {
//!     MutationOutcome::Applied(cart) => println!("{} items", cart.total_items),
//!     MutationOutcome::Queued { operation_id, .. } => println!("queued {operation_id}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod network;
pub mod status;
mod tasks;
mod worker;

pub use network::{NetworkMonitor, NetworkStatus};
pub use status::{ConnectionStatus, SyncStatus};

use crate::api::{CartApi, HttpCartApi};
use crate::broadcast::{create_backend, CrossReplicaBroadcast, PlatformCapabilities};
use crate::offline::{OfflineQueue, OptimisticManager, ReplayOutcome, ReplayResult};
use crate::realtime::{EventSourceTransport, RealtimeTransport, TransportKind, WebSocketTransport};
use crate::shared::cart::Cart;
use crate::shared::config::{ConfigError, SyncConfig};
use crate::shared::error::{ApiError, CartError, PersistenceError};
use crate::shared::mutation::CartMutation;
use crate::snapshot::SnapshotStore;
use crate::storage::KeyValueStore;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use worker::Command;

/// Result of a mutation that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Confirmed by the server; carries the cart as now displayed
    Applied(Cart),
    /// The server was unreachable. The mutation waits in the offline queue
    /// and stays visible in `cart`.
    Queued { operation_id: Uuid, cart: Cart },
}

impl MutationOutcome {
    pub fn cart(&self) -> &Cart {
        match self {
            MutationOutcome::Applied(cart) | MutationOutcome::Queued { cart, .. } => cart,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued { .. })
    }
}

/// Failures while assembling a session
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("storage unavailable: {0}")]
    Storage(#[from] PersistenceError),

    #[error("cart API client: {0}")]
    Api(#[from] ApiError),
}

/// Collaborators a session is built from
pub struct SessionParts {
    pub api: Arc<dyn CartApi>,
    pub store: Arc<dyn KeyValueStore>,
    pub capabilities: PlatformCapabilities,
    /// Preferred realtime transport
    pub transport: Option<Arc<dyn RealtimeTransport>>,
    /// Used once the preferred transport gives up reconnecting
    pub fallback: Option<Arc<dyn RealtimeTransport>>,
}

impl SessionParts {
    /// HTTP API client, WebSocket transport with event-stream fallback, and
    /// storage-event broadcast over `store`
    pub fn from_config(config: &SyncConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, StartupError> {
        let api = HttpCartApi::with_timeout(config.api_url.clone(), config.optimistic.confirmation_timeout)?;

        let transport = config.transport.realtime_url.as_ref().map(|url| {
            Arc::new(WebSocketTransport::new(url.clone(), config.transport.clone())) as Arc<dyn RealtimeTransport>
        });
        let fallback = config.transport.events_url.as_ref().map(|url| {
            Arc::new(EventSourceTransport::new(url.clone(), config.transport.clone())) as Arc<dyn RealtimeTransport>
        });

        Ok(Self {
            api: Arc::new(api),
            capabilities: PlatformCapabilities::storage(Arc::clone(&store)),
            store,
            transport,
            fallback,
        })
    }
}

/// Cart session controller. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct CartSession {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    session_id: RwLock<String>,
    api: Arc<dyn CartApi>,
    manager: Mutex<OptimisticManager>,
    /// Mutations waiting in the offline queue, in queue order
    queued: Mutex<Vec<CartMutation>>,
    snapshots: SnapshotStore,
    queue: OfflineQueue,
    broadcast: CrossReplicaBroadcast,
    active: RwLock<Option<Arc<dyn RealtimeTransport>>>,
    fallback: Option<Arc<dyn RealtimeTransport>>,
    network: NetworkMonitor,
    status: watch::Sender<SyncStatus>,
    commands: mpsc::UnboundedSender<Command>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl CartSession {
    /// Build a session and start its background tasks.
    ///
    /// Must be called inside a Tokio runtime. Nothing touches the network
    /// until [`connect`](Self::connect) or the first mutation.
    pub fn new(config: SyncConfig, parts: SessionParts) -> Result<Self, StartupError> {
        config.validate()?;

        let session_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let replica_id = Uuid::new_v4();
        let cart = Cart::empty(session_id.clone()).with_vat_rate(config.vat_rate_bps);

        let backend = create_backend(&parts.capabilities, &config.broadcast);
        let broadcast = CrossReplicaBroadcast::new(backend, replica_id, config.broadcast.clone());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        broadcast.on_any(move |message| {
            let _ = inbound_tx.send(message.clone());
        });
        broadcast.on_error(|error| {
            tracing::warn!(%error, "Cross-replica broadcast failed");
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            manager: Mutex::new(OptimisticManager::new(cart.clone(), &config.optimistic)),
            queued: Mutex::new(Vec::new()),
            snapshots: SnapshotStore::new(Arc::clone(&parts.store), config.snapshot.clone()),
            queue: OfflineQueue::new(
                Arc::clone(&parts.store),
                Arc::clone(&parts.api),
                session_id.clone(),
                config.offline.clone(),
            ),
            api: parts.api,
            broadcast,
            active: RwLock::new(parts.transport.clone()),
            fallback: parts.fallback,
            network: NetworkMonitor::default(),
            status: watch::channel(SyncStatus::new(cart)).0,
            commands,
            permits: Arc::new(Semaphore::new(config.optimistic.max_pending_operations)),
            cancel: CancellationToken::new(),
            session_id: RwLock::new(session_id.clone()),
            config,
        });

        tokio::spawn(worker::run(Arc::clone(&inner), command_rx));
        tokio::spawn(tasks::inbound_broadcasts(Arc::clone(&inner), inbound_rx));
        tokio::spawn(tasks::network_changes(Arc::clone(&inner)));
        tokio::spawn(tasks::maintenance(Arc::clone(&inner)));
        if let Some(transport) = parts.transport {
            transport.subscribe_session(&session_id);
            tokio::spawn(tasks::transport_events(Arc::clone(&inner), transport));
        }

        tracing::info!(%session_id, %replica_id, "Cart session started");
        Ok(Self { inner })
    }

    /// Connect the realtime transport.
    ///
    /// A failed first handshake is returned, but the transport keeps
    /// reconnecting (and eventually falls back) in the background.
    pub async fn connect(&self) -> Result<(), crate::shared::error::TransportError> {
        let Some(transport) = self.inner.active_transport() else {
            tracing::info!("No realtime endpoint configured, running without push updates");
            return Ok(());
        };
        transport.subscribe_session(&self.inner.session_id());
        let kind = transport.kind();
        self.inner.publish_with(|status| {
            status.connection_status = ConnectionStatus::Connecting;
        });
        transport.connect().await.inspect_err(|e| {
            tracing::warn!(error = %e, ?kind, "Realtime connection failed, retrying in background");
        })
    }

    pub async fn add_to_cart(
        &self,
        product_id: impl Into<String>,
        quantity: u32,
        unit_price: i64,
    ) -> Result<MutationOutcome, CartError> {
        self.mutate(CartMutation::AddItem {
            product_id: product_id.into(),
            quantity,
            unit_price,
        })
        .await
    }

    /// Set a line's quantity; zero removes the line
    pub async fn update_quantity(
        &self,
        product_id: impl Into<String>,
        quantity: u32,
    ) -> Result<MutationOutcome, CartError> {
        self.mutate(CartMutation::UpdateQuantity {
            product_id: product_id.into(),
            quantity,
        })
        .await
    }

    pub async fn remove_from_cart(&self, product_id: impl Into<String>) -> Result<MutationOutcome, CartError> {
        self.mutate(CartMutation::RemoveItem {
            product_id: product_id.into(),
        })
        .await
    }

    pub async fn clear_cart(&self) -> Result<MutationOutcome, CartError> {
        self.mutate(CartMutation::ClearCart).await
    }

    /// Apply a mutation optimistically and wait for the server's verdict.
    ///
    /// Waits for a free slot when `max_pending_operations` mutations are
    /// already in flight.
    pub async fn mutate(&self, mutation: CartMutation) -> Result<MutationOutcome, CartError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(CartError::SessionClosed);
        }
        let permit = Arc::clone(&inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| CartError::SessionClosed)?;

        let (reply, response) = oneshot::channel();
        {
            // Optimistic order and worker order must agree.
            let mut manager = inner.manager.lock();
            let applied = manager.apply_optimistic_update(mutation.clone())?;
            let command = Command {
                id: applied.operation_id,
                session_id: inner.session_id(),
                mutation,
                reply,
                permit,
            };
            if inner.commands.send(command).is_err() {
                let _ = manager.fail_operation(applied.operation_id, ApiError::offline("session closed"));
                return Err(CartError::SessionClosed);
            }
        }
        inner.publish();

        response.await.map_err(|_| CartError::SessionClosed)?
    }

    /// Fetch the authoritative cart from the server
    pub async fn refresh_cart(&self) -> Result<Cart, CartError> {
        let inner = &self.inner;
        let session_id = inner.session_id();
        let timeout = inner.config.optimistic.confirmation_timeout;
        let result = match tokio::time::timeout(timeout, inner.api.get_cart(&session_id)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        };

        match result {
            Ok(cart) => {
                if inner.session_id() == session_id {
                    inner.manager.lock().set_authoritative(cart.clone());
                    inner.snapshots.save_snapshot(&cart).await;
                    inner.mark_online();
                    inner.mark_synced();
                }
                Ok(inner.visible_cart())
            }
            Err(e) => {
                if e.is_connectivity() {
                    inner.mark_offline();
                }
                tracing::warn!(session_id = %session_id, error = %e, "Failed to refresh cart");
                inner.publish_with(|status| status.last_error = Some(e.to_string()));
                Err(CartError::Api(e))
            }
        }
    }

    /// Replay the offline queue now
    pub async fn force_sync(&self) -> Vec<ReplayResult> {
        self.inner.replay_offline().await
    }

    /// Restore the cart from the newest valid snapshot, merging with the
    /// in-memory cart when it has items. Also reloads the offline queue.
    pub async fn recover(&self) -> Cart {
        let inner = &self.inner;
        let session_id = inner.session_id();
        let current = inner.authoritative_cart();

        if let Some(cart) = inner.snapshots.recover_cart(Some(&current), &session_id).await {
            if inner.session_id() == session_id {
                inner.manager.lock().set_authoritative(cart);
            }
        }
        inner.reload_queued().await;
        inner.publish();
        inner.visible_cart()
    }

    /// Adopt another session id and tell the other replicas
    pub async fn switch_session(&self, session_id: impl Into<String>) {
        self.inner.switch_session(session_id.into(), true).await;
    }

    /// Report connectivity observed by the host. Going online replays the
    /// offline queue.
    pub fn set_network_status(&self, status: NetworkStatus) {
        match status {
            NetworkStatus::Online => self.inner.mark_online(),
            NetworkStatus::Offline => self.inner.mark_offline(),
        }
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// Cart as the user should see it: server state, then queued offline
    /// mutations, then in-flight mutations
    pub fn cart(&self) -> Cart {
        self.inner.visible_cart()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().is_connected
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.status.borrow().connection_status
    }

    pub fn pending_operations(&self) -> usize {
        self.inner.manager.lock().pending_count()
    }

    pub fn queued_operations(&self) -> usize {
        self.inner.queued.lock().len()
    }

    pub fn last_sync_time(&self) -> Option<chrono::DateTime<Utc>> {
        self.inner.status.borrow().last_sync_time
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.inner.network.status()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    /// Receive every status change
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Stop background tasks, close transports and the broadcast channel,
    /// and take a final snapshot
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }
        inner.cancel.cancel();
        inner.permits.close();

        let active = inner.active_transport();
        if let Some(transport) = &active {
            transport.close().await;
        }
        if let Some(fallback) = &inner.fallback {
            let is_active = active.as_ref().is_some_and(|t| Arc::ptr_eq(t, fallback));
            if !is_active {
                fallback.close().await;
            }
        }
        inner.broadcast.close().await;

        let cart = inner.authoritative_cart();
        if !cart.is_empty() {
            inner.snapshots.save_snapshot(&cart).await;
        }
        inner.publish_with(|status| {
            status.is_connected = false;
            status.connection_status = ConnectionStatus::Disconnected;
        });
        tracing::info!(session_id = %inner.session_id(), "Cart session closed");
    }
}

impl Inner {
    fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    fn empty_cart(&self, session_id: &str) -> Cart {
        Cart::empty(session_id).with_vat_rate(self.config.vat_rate_bps)
    }

    fn active_transport(&self) -> Option<Arc<dyn RealtimeTransport>> {
        self.active.read().clone()
    }

    /// Last cart confirmed by the server or another replica. This is what
    /// gets snapshotted; queued mutations are persisted by the queue.
    fn authoritative_cart(&self) -> Cart {
        self.manager.lock().authoritative_state().clone()
    }

    /// Queued mutations precede every in-flight one
    fn visible_cart(&self) -> Cart {
        let manager = self.manager.lock();
        let base = self
            .queued
            .lock()
            .iter()
            .fold(manager.authoritative_state().clone(), |cart, mutation| mutation.apply_to(&cart));
        manager
            .pending_operations()
            .iter()
            .fold(base, |cart, op| op.mutation.apply_to(&cart))
    }

    fn has_queued(&self) -> bool {
        !self.queued.lock().is_empty()
    }

    fn publish(&self) {
        self.publish_with(|_| {});
    }

    /// Recompute the derived status fields, apply `update` and notify
    fn publish_with(&self, update: impl FnOnce(&mut SyncStatus)) {
        let cart = self.visible_cart();
        let pending = self.manager.lock().pending_count();
        let queued = self.queued.lock().len();
        let session_id = self.session_id();
        let network = self.network.status();
        let syncing = self.queue.is_sync_in_progress();

        self.status.send_modify(|status| {
            status.session_id = session_id;
            status.cart = cart;
            status.pending_operations = pending;
            status.queued_operations = queued;
            status.network = network;
            status.is_syncing = syncing;
            update(status);
        });
    }

    fn mark_synced(&self) {
        self.publish_with(|status| {
            status.last_sync_time = Some(Utc::now());
            status.last_error = None;
        });
    }

    fn mark_offline(&self) {
        self.queue.set_online(false);
        self.network.set(NetworkStatus::Offline);
    }

    /// A reachable server means we are online; the network task replays
    fn mark_online(&self) {
        self.network.set(NetworkStatus::Online);
    }

    /// Mirror the persisted offline queue in memory
    async fn reload_queued(&self) {
        match self.queue.pending_operations().await {
            Ok(operations) => {
                *self.queued.lock() = operations.into_iter().map(|op| op.mutation).collect();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to read offline queue"),
        }
    }

    /// Replay unless a pass is already running
    async fn replay_offline(&self) -> Vec<ReplayResult> {
        self.publish_with(|status| status.is_syncing = true);
        let session_id = self.session_id();
        let results = self.queue.force_sync().await;
        self.adopt_replay(session_id, results).await
    }

    /// Replay, waiting behind a running pass
    async fn drain_offline(&self) -> Vec<ReplayResult> {
        self.publish_with(|status| status.is_syncing = true);
        let session_id = self.session_id();
        let results = self.queue.sync().await;
        self.adopt_replay(session_id, results).await
    }

    async fn adopt_replay(&self, session_id: String, results: Vec<ReplayResult>) -> Vec<ReplayResult> {

        let mut latest = None;
        let mut deferred = false;
        let mut dropped = Vec::new();
        for result in &results {
            match &result.outcome {
                ReplayOutcome::Applied(cart) => latest = Some(cart.clone()),
                ReplayOutcome::Deferred(_) => deferred = true,
                ReplayOutcome::Failed(error) => dropped.push(format!("{}: {}", result.operation_id, error)),
                ReplayOutcome::Skipped | ReplayOutcome::RetryQueued(_) => {}
            }
        }

        self.reload_queued().await;
        if let Some(cart) = latest.filter(|_| self.session_id() == session_id) {
            self.manager.lock().set_authoritative(cart.clone());
            self.snapshots.save_snapshot(&cart).await;
            self.broadcast.broadcast_cart_update(&cart, &session_id);
            self.mark_synced();
        }
        if deferred {
            self.mark_offline();
        }
        if !dropped.is_empty() {
            tracing::error!(session_id = %session_id, dropped = ?dropped, "Offline operations could not be applied");
            self.publish_with(|status| {
                status.last_error = Some(format!("dropped offline operations: {}", dropped.join(", ")));
            });
        }
        self.publish();
        results
    }

    /// Replace the authoritative cart with one pushed by the server or
    /// another replica. Carts of other sessions are ignored.
    fn adopt_remote(&self, cart: Cart) -> bool {
        if cart.session_id != self.session_id() {
            tracing::debug!(session_id = %cart.session_id, "Ignoring cart of another session");
            return false;
        }
        self.manager.lock().set_authoritative(cart);
        true
    }

    async fn switch_session(&self, session_id: String, announce: bool) {
        let previous = {
            let mut current = self.session_id.write();
            if *current == session_id {
                return;
            }
            std::mem::replace(&mut *current, session_id.clone())
        };

        self.queue.set_session(session_id.clone());
        self.manager.lock().reset(self.empty_cart(&session_id));
        if let Some(transport) = self.active_transport() {
            transport.subscribe_session(&session_id);
        }
        self.reload_queued().await;
        if let Some(cart) = self.snapshots.recover_cart(None, &session_id).await {
            self.adopt_remote(cart);
        }
        if announce {
            self.broadcast.broadcast_session_change(Some(&previous), &session_id);
        }

        self.publish_with(|status| status.last_error = None);
        tracing::info!(%previous, current = %session_id, announce, "Switched cart session");
    }

    /// Swap to the fallback transport after the preferred one gave up
    fn switch_to_fallback(self: &Arc<Self>) -> bool {
        let Some(fallback) = self.fallback.clone() else {
            return false;
        };
        {
            let mut active = self.active.write();
            if active.as_ref().is_some_and(|t| t.kind() == TransportKind::EventSource) {
                return false;
            }
            *active = Some(Arc::clone(&fallback));
        }

        tracing::warn!("Realtime transport gave up, switching to event stream fallback");
        fallback.subscribe_session(&self.session_id());
        tokio::spawn(tasks::transport_events(Arc::clone(self), Arc::clone(&fallback)));
        self.publish_with(|status| status.connection_status = ConnectionStatus::Connecting);

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = fallback.connect() => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Fallback transport failed to connect");
                    }
                }
            }
        });
        true
    }
}
