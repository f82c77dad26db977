//! # Sync Status
//!
//! Read model published to the presentation layer on every change.

use super::network::NetworkStatus;
use crate::shared::cart::Cart;
use chrono::{DateTime, Utc};

/// State of the realtime connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Connected through the push-only fallback
    Fallback,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            ConnectionStatus::Fallback => f.write_str("connected (fallback)"),
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub session_id: String,
    /// Cart as the user should see it
    pub cart: Cart,
    pub is_connected: bool,
    pub connection_status: ConnectionStatus,
    pub network: NetworkStatus,
    /// Mutations awaiting server confirmation
    pub pending_operations: usize,
    /// Mutations waiting in the offline queue
    pub queued_operations: usize,
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn new(cart: Cart) -> Self {
        Self {
            session_id: cart.session_id.clone(),
            cart,
            is_connected: false,
            connection_status: ConnectionStatus::Disconnected,
            network: NetworkStatus::Online,
            pending_operations: 0,
            queued_operations: 0,
            is_syncing: false,
            last_sync_time: None,
            last_error: None,
        }
    }

    /// Nothing left to confirm or replay
    pub fn is_settled(&self) -> bool {
        self.pending_operations == 0 && self.queued_operations == 0 && !self.is_syncing
    }
}
