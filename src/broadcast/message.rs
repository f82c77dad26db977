use crate::shared::cart::Cart;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Message kinds replicas exchange, used to register handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastKind {
    CartUpdate,
    CartClear,
    ItemAdded,
    ItemRemoved,
    QuantityUpdate,
    SessionChange,
}

impl std::fmt::Display for BroadcastKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BroadcastKind::CartUpdate => "CART_UPDATE",
            BroadcastKind::CartClear => "CART_CLEAR",
            BroadcastKind::ItemAdded => "ITEM_ADDED",
            BroadcastKind::ItemRemoved => "ITEM_REMOVED",
            BroadcastKind::QuantityUpdate => "QUANTITY_UPDATE",
            BroadcastKind::SessionChange => "SESSION_CHANGE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum BroadcastPayload {
    CartUpdate {
        cart: Cart,
    },
    CartClear,
    ItemAdded {
        product_id: String,
        quantity: u32,
        cart: Cart,
    },
    ItemRemoved {
        product_id: String,
        cart: Cart,
    },
    QuantityUpdate {
        product_id: String,
        quantity: u32,
        cart: Cart,
    },
    SessionChange {
        previous_session_id: Option<String>,
        new_session_id: String,
    },
}

impl BroadcastPayload {
    pub fn kind(&self) -> BroadcastKind {
        match self {
            BroadcastPayload::CartUpdate { .. } => BroadcastKind::CartUpdate,
            BroadcastPayload::CartClear => BroadcastKind::CartClear,
            BroadcastPayload::ItemAdded { .. } => BroadcastKind::ItemAdded,
            BroadcastPayload::ItemRemoved { .. } => BroadcastKind::ItemRemoved,
            BroadcastPayload::QuantityUpdate { .. } => BroadcastKind::QuantityUpdate,
            BroadcastPayload::SessionChange { .. } => BroadcastKind::SessionChange,
        }
    }

    /// Cart state carried by the message, if any
    pub fn cart(&self) -> Option<&Cart> {
        match self {
            BroadcastPayload::CartUpdate { cart }
            | BroadcastPayload::ItemAdded { cart, .. }
            | BroadcastPayload::ItemRemoved { cart, .. }
            | BroadcastPayload::QuantityUpdate { cart, .. } => Some(cart),
            BroadcastPayload::CartClear | BroadcastPayload::SessionChange { .. } => None,
        }
    }

    /// Identity of the change, without the cart it produced. Messages with
    /// the same key inside the debounce window collapse into the last one.
    pub fn debounce_key(&self, session_id: &str) -> String {
        match self {
            BroadcastPayload::ItemAdded { product_id, .. }
            | BroadcastPayload::ItemRemoved { product_id, .. }
            | BroadcastPayload::QuantityUpdate { product_id, .. } => {
                format!("{}:{}:{}", self.kind(), session_id, product_id)
            }
            BroadcastPayload::SessionChange { new_session_id, .. } => {
                format!("{}:{}", self.kind(), new_session_id)
            }
            BroadcastPayload::CartUpdate { .. } | BroadcastPayload::CartClear => {
                format!("{}:{}", self.kind(), session_id)
            }
        }
    }
}

/// Envelope exchanged between replicas of one browsing session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    /// Unique per message, used to deduplicate storage log reads
    pub id: Uuid,
    #[serde(flatten)]
    pub payload: BroadcastPayload,
    pub timestamp: DateTime<Utc>,
    /// Replica that posted the message
    pub origin_id: Uuid,
    pub session_id: String,
}

impl BroadcastMessage {
    pub fn new(payload: BroadcastPayload, origin_id: Uuid, session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            timestamp: Utc::now(),
            origin_id,
            session_id: session_id.into(),
        }
    }

    pub fn kind(&self) -> BroadcastKind {
        self.payload.kind()
    }

    /// Time since the message was posted; zero for timestamps in the future
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}
