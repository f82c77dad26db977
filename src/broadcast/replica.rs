use super::{BackendKind, BroadcastKind, BroadcastMessage, BroadcastPayload, ChannelBackend, Debouncer};
use crate::shared::cart::Cart;
use crate::shared::config::BroadcastConfig;
use crate::shared::error::BroadcastError;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type MessageHandler = Arc<dyn Fn(&BroadcastMessage) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&BroadcastError) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    by_kind: HashMap<BroadcastKind, Vec<MessageHandler>>,
    any: Vec<MessageHandler>,
    errors: Vec<ErrorHandler>,
}

struct Inner {
    replica_id: Uuid,
    backend: Arc<dyn ChannelBackend>,
    config: BroadcastConfig,
    debouncer: Debouncer,
    handlers: RwLock<Handlers>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.debouncer.cancel_all();
    }
}

impl Inner {
    fn receive(&self, message: BroadcastMessage) {
        if self.config.suppress_self_echo && message.origin_id == self.replica_id {
            tracing::trace!(id = %message.id, "Ignoring own broadcast");
            return;
        }
        let age = message.age();
        if age > self.config.staleness_window {
            tracing::debug!(id = %message.id, kind = %message.kind(), ?age, "Discarding stale broadcast");
            return;
        }

        let (specific, any) = {
            let handlers = self.handlers.read();
            (
                handlers.by_kind.get(&message.kind()).cloned().unwrap_or_default(),
                handlers.any.clone(),
            )
        };
        for handler in specific.iter().chain(any.iter()) {
            handler(&message);
        }
    }

    fn report(&self, error: &BroadcastError) {
        tracing::warn!(error = %error, "Broadcast failed");
        let handlers = self.handlers.read().errors.clone();
        for handler in handlers {
            handler(error);
        }
    }
}

/// Cart change fan-out between replicas of one session.
///
/// Outbound messages are debounced per change identity; inbound ones older
/// than the staleness window, or posted by this replica when self-echo
/// suppression is on, are dropped before reaching handlers. Failures go to
/// the error handlers and never reach the caller.
#[derive(Clone)]
pub struct CrossReplicaBroadcast {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CrossReplicaBroadcast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossReplicaBroadcast")
            .field("replica_id", &self.inner.replica_id)
            .field("backend", &self.inner.backend.kind())
            .finish()
    }
}

impl CrossReplicaBroadcast {
    /// Start listening on `backend`. Must be called inside a tokio runtime.
    pub fn new(backend: Arc<dyn ChannelBackend>, replica_id: Uuid, config: BroadcastConfig) -> Self {
        let receiver = backend.subscribe();
        let inner = Arc::new(Inner {
            replica_id,
            debouncer: Debouncer::new(config.debounce),
            backend,
            config,
            handlers: RwLock::new(Handlers::default()),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(listen(Arc::downgrade(&inner), receiver, inner.cancel.clone()));
        Self { inner }
    }

    pub fn replica_id(&self) -> Uuid {
        self.inner.replica_id
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    /// Outbound messages still inside their debounce window
    pub fn waiting(&self) -> usize {
        self.inner.debouncer.waiting()
    }

    /// Register a handler for one message kind
    pub fn on<F>(&self, kind: BroadcastKind, handler: F)
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .by_kind
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler for every accepted message
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.inner.handlers.write().any.push(Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&BroadcastError) + Send + Sync + 'static,
    {
        self.inner.handlers.write().errors.push(Arc::new(handler));
    }

    pub fn broadcast_cart_update(&self, cart: &Cart, session_id: &str) {
        self.publish(session_id, BroadcastPayload::CartUpdate { cart: cart.clone() });
    }

    pub fn broadcast_cart_clear(&self, session_id: &str) {
        self.publish(session_id, BroadcastPayload::CartClear);
    }

    pub fn broadcast_item_added(&self, product_id: &str, quantity: u32, cart: &Cart, session_id: &str) {
        self.publish(
            session_id,
            BroadcastPayload::ItemAdded {
                product_id: product_id.to_string(),
                quantity,
                cart: cart.clone(),
            },
        );
    }

    pub fn broadcast_item_removed(&self, product_id: &str, cart: &Cart, session_id: &str) {
        self.publish(
            session_id,
            BroadcastPayload::ItemRemoved {
                product_id: product_id.to_string(),
                cart: cart.clone(),
            },
        );
    }

    pub fn broadcast_quantity_update(&self, product_id: &str, quantity: u32, cart: &Cart, session_id: &str) {
        self.publish(
            session_id,
            BroadcastPayload::QuantityUpdate {
                product_id: product_id.to_string(),
                quantity,
                cart: cart.clone(),
            },
        );
    }

    pub fn broadcast_session_change(&self, previous_session_id: Option<&str>, new_session_id: &str) {
        self.publish(
            new_session_id,
            BroadcastPayload::SessionChange {
                previous_session_id: previous_session_id.map(str::to_string),
                new_session_id: new_session_id.to_string(),
            },
        );
    }

    fn publish(&self, session_id: &str, payload: BroadcastPayload) {
        let key = payload.debounce_key(session_id);
        let mut message = BroadcastMessage::new(payload, self.inner.replica_id, session_id);
        let inner = Arc::clone(&self.inner);
        self.inner.debouncer.schedule(key, async move {
            message.timestamp = Utc::now();
            match inner.backend.post(&message).await {
                Ok(()) => tracing::debug!(id = %message.id, kind = %message.kind(), "Broadcast posted"),
                Err(e) => inner.report(&e),
            }
        });
    }

    /// Stop listening, drop waiting messages and close the backend
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.debouncer.cancel_all();
        self.inner.backend.close().await;
    }
}

async fn listen(inner: Weak<Inner>, mut receiver: broadcast::Receiver<BroadcastMessage>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = receiver.recv() => match received {
                Ok(message) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.receive(message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Broadcast receiver lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("Broadcast listener stopped");
}
