//! # Realtime Transport
//!
//! Push channel delivering server-originated cart events.
//!
//! ## Architecture
//!
//! - `websocket.rs`: duplex transport; carries heartbeats and the session
//!   subscription
//! - `sse.rs`: push-only fallback over server-sent events
//! - `core.rs`: supervision shared by both: first-handshake reporting,
//!   fixed-interval reconnection capped at `max_reconnect_attempts`
//! - `heartbeat.rs`: liveness tracking for the duplex transport
//!
//! Lifecycle is published as [`TransportEvent`]s. Connection errors are
//! reported but never fatal, undecodable messages are logged and dropped,
//! and `close()` shuts down with [`CLIENT_SHUTDOWN_CODE`] without
//! reconnecting.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cartsync::realtime::{RealtimeTransport, TransportEvent, WebSocketTransport};
//! use cartsync::shared::config::TransportConfig;
//!
//! # async fn example() -> Result<(), cartsync::shared::TransportError> {
//! let transport = WebSocketTransport::new("ws://localhost:3000/ws/cart", TransportConfig::default());
//! let mut events = transport.subscribe();
//! transport.connect().await?;
//! while let Ok(event) = events.recv().await {
//!     if let TransportEvent::Message(message) = event {
//!         println!("{message:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod core;
pub mod heartbeat;
pub mod sse;
pub mod websocket;

pub use heartbeat::HeartbeatMonitor;
pub use sse::{EventSourceTransport, SseDecoder, SseFrame};
pub use websocket::WebSocketTransport;

use crate::shared::error::TransportError;
use crate::shared::event::{ClientMessage, ServerEvent};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Close code sent when the client shuts the connection down on purpose
pub const CLIENT_SHUTDOWN_CODE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    EventSource,
}

/// Lifecycle notifications of a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(ServerEvent),
    Closed { code: Option<u16>, reason: String },
    Error(TransportError),
    Reconnecting { attempt: u32 },
    Reconnected,
    /// Reconnection gave up; switch to the fallback transport
    MaxAttemptsReached { attempts: u32 },
}

/// Push channel from the server
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Resolve on the first successful handshake. On failure the transport
    /// keeps reconnecting in the background.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Queue a message for the server; `false` when not connected or the
    /// transport cannot send
    fn send(&self, message: ClientMessage) -> bool;

    /// Subscribe to events for a session, now and after every reconnect
    fn subscribe_session(&self, session_id: &str);

    /// Close without reconnecting
    async fn close(&self);

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    fn is_connected(&self) -> bool;
}
