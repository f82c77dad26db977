//! # Network Monitor
//!
//! Connectivity as seen by the session. The host reports changes (for
//! example from an OS reachability callback) and the session reports what
//! it learns from transports and API calls. An offline to online transition
//! triggers replay of the offline queue.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    status: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        Self {
            status: Arc::new(watch::channel(initial).0),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status() == NetworkStatus::Online
    }

    /// Record a status; returns whether it changed
    pub fn set(&self, status: NetworkStatus) -> bool {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?status, "Network status changed");
            *current = status;
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Online)
    }
}
