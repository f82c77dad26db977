//! Background tasks of a session. Each one holds the session alive until
//! its cancellation token fires.

use super::{ConnectionStatus, Inner, NetworkStatus};
use crate::broadcast::{BroadcastMessage, BroadcastPayload};
use crate::realtime::{RealtimeTransport, TransportEvent, TransportKind};
use crate::shared::event::ServerEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const MIN_TICK: Duration = Duration::from_secs(1);

/// Apply messages from other replicas
pub(super) async fn inbound_broadcasts(inner: Arc<Inner>, mut messages: mpsc::UnboundedReceiver<BroadcastMessage>) {
    loop {
        let message = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        apply_broadcast(&inner, message).await;
    }
}

async fn apply_broadcast(inner: &Arc<Inner>, message: BroadcastMessage) {
    if let BroadcastPayload::SessionChange { new_session_id, .. } = &message.payload {
        inner.switch_session(new_session_id.clone(), false).await;
        return;
    }
    if message.session_id != inner.session_id() {
        tracing::debug!(kind = %message.kind(), session_id = %message.session_id, "Broadcast for another session");
        return;
    }

    let applied = match message.payload {
        BroadcastPayload::CartClear => inner.adopt_remote(inner.empty_cart(&message.session_id)),
        payload => match payload.cart() {
            Some(cart) => inner.adopt_remote(cart.clone()),
            None => false,
        },
    };
    if applied {
        tracing::debug!(origin = %message.origin_id, "Applied cart from another replica");
        inner.publish();
    }
}

/// Follow one transport's lifecycle until the session closes
pub(super) async fn transport_events(inner: Arc<Inner>, transport: Arc<dyn RealtimeTransport>) {
    let mut events = transport.subscribe();
    let kind = transport.kind();

    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, ?kind, "Transport events lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if !is_active(&inner, &transport) {
            if matches!(event, TransportEvent::Message(_)) {
                tracing::debug!(?kind, "Ignoring message from inactive transport");
            }
            continue;
        }
        if handle_transport_event(&inner, kind, event).await {
            break;
        }
    }
}

fn is_active(inner: &Inner, transport: &Arc<dyn RealtimeTransport>) -> bool {
    inner
        .active
        .read()
        .as_ref()
        .is_some_and(|active| Arc::ptr_eq(active, transport))
}

/// Returns `true` once this transport is done for good
async fn handle_transport_event(inner: &Arc<Inner>, kind: TransportKind, event: TransportEvent) -> bool {
    let connected = match kind {
        TransportKind::WebSocket => ConnectionStatus::Connected,
        TransportKind::EventSource => ConnectionStatus::Fallback,
    };

    match event {
        TransportEvent::Opened | TransportEvent::Reconnected => {
            inner.publish_with(|status| {
                status.is_connected = true;
                status.connection_status = connected;
            });
            inner.mark_online();
        }
        TransportEvent::Message(event) => apply_server_event(inner, event).await,
        TransportEvent::Closed { code, reason } => {
            tracing::info!(?kind, ?code, %reason, "Realtime connection closed");
            inner.publish_with(|status| {
                status.is_connected = false;
                status.connection_status = ConnectionStatus::Disconnected;
            });
        }
        TransportEvent::Reconnecting { attempt } => {
            inner.publish_with(|status| {
                status.is_connected = false;
                status.connection_status = ConnectionStatus::Reconnecting { attempt };
            });
        }
        TransportEvent::Error(error) => {
            tracing::debug!(?kind, %error, "Realtime transport error");
        }
        TransportEvent::MaxAttemptsReached { attempts } => {
            tracing::warn!(?kind, attempts, "Realtime reconnection abandoned");
            if !inner.switch_to_fallback() {
                inner.publish_with(|status| {
                    status.is_connected = false;
                    status.connection_status = ConnectionStatus::Disconnected;
                });
            }
            return true;
        }
    }
    false
}

async fn apply_server_event(inner: &Inner, event: ServerEvent) {
    let session_id = inner.session_id();
    if event.session_id() != Some(session_id.as_str()) {
        tracing::debug!(event_session = ?event.session_id(), "Server event for another session");
        return;
    }

    let cart = match event {
        ServerEvent::CartUpdated { cart, .. }
        | ServerEvent::ItemAdded { cart, .. }
        | ServerEvent::ItemRemoved { cart, .. }
        | ServerEvent::QuantityUpdated { cart, .. } => cart,
        ServerEvent::CartCleared { .. } => inner.empty_cart(&session_id),
        ServerEvent::Pong { .. } => return,
    };
    if !inner.adopt_remote(cart.clone()) {
        return;
    }

    inner.snapshots.save_snapshot(&cart).await;
    if cart.is_empty() {
        inner.broadcast.broadcast_cart_clear(&session_id);
    } else {
        inner.broadcast.broadcast_cart_update(&cart, &session_id);
    }
    inner.mark_synced();
}

/// Mirror connectivity into the offline queue and replay when it returns
pub(super) async fn network_changes(inner: Arc<Inner>) {
    let mut changes = inner.network.subscribe();
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let status = *changes.borrow_and_update();
        inner.publish();

        let online = status == NetworkStatus::Online;
        if inner.queue.set_online(online) {
            tracing::info!(session_id = %inner.session_id(), "Back online, replaying offline queue");
            inner.replay_offline().await;
        }
    }
}

/// Periodic snapshots, record cleanup, and replay of operations waiting for
/// a retry
pub(super) async fn maintenance(inner: Arc<Inner>) {
    let snapshot_every = inner.config.snapshot.snapshot_interval.max(MIN_TICK);
    let cleanup_every = inner.config.snapshot.cleanup_interval.max(MIN_TICK);
    let mut snapshot_tick = interval_at(Instant::now() + snapshot_every, snapshot_every);
    let mut cleanup_tick = interval_at(Instant::now() + cleanup_every, cleanup_every);
    snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = snapshot_tick.tick() => {
                let cart = inner.authoritative_cart();
                if !cart.is_empty() {
                    inner.snapshots.save_snapshot(&cart).await;
                }
                let waiting = !inner.queued.lock().is_empty();
                if waiting && inner.network.is_online() && !inner.queue.is_sync_in_progress() {
                    inner.replay_offline().await;
                }
            }
            _ = cleanup_tick.tick() => {
                if let Err(e) = inner.snapshots.cleanup().await {
                    tracing::warn!(error = %e, "Snapshot cleanup failed");
                }
            }
        }
    }
}
