//! Realtime Wire Messages
//!
//! Messages exchanged with the realtime push endpoint. Server events are a
//! closed tagged union keyed by `type` (`CART_UPDATED`, `CART_CLEARED`, ...)
//! so consumers match them exhaustively.
use crate::shared::cart::Cart;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-originated message delivered over a realtime transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Full authoritative cart replaced
    CartUpdated { session_id: String, cart: Cart },
    /// Cart emptied
    CartCleared { session_id: String },
    /// A product was added
    ItemAdded {
        session_id: String,
        product_id: String,
        quantity: u32,
        cart: Cart,
    },
    /// A product was removed
    ItemRemoved {
        session_id: String,
        product_id: String,
        cart: Cart,
    },
    /// A product's quantity changed
    QuantityUpdated {
        session_id: String,
        product_id: String,
        quantity: u32,
        cart: Cart,
    },
    /// Reply to a client heartbeat
    Pong { timestamp: DateTime<Utc> },
}

impl ServerEvent {
    /// Session the event is scoped to; heartbeat replies have none
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::CartUpdated { session_id, .. }
            | ServerEvent::CartCleared { session_id }
            | ServerEvent::ItemAdded { session_id, .. }
            | ServerEvent::ItemRemoved { session_id, .. }
            | ServerEvent::QuantityUpdated { session_id, .. } => Some(session_id),
            ServerEvent::Pong { .. } => None,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, ServerEvent::Pong { .. })
    }

    /// Decode a text frame
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Client-originated message; only the duplex transport can carry these
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Liveness check, answered by [`ServerEvent::Pong`]
    Ping { timestamp: DateTime<Utc> },
    /// Ask for events scoped to a session
    Subscribe { session_id: String },
}

impl ClientMessage {
    pub fn ping() -> Self {
        ClientMessage::Ping {
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
