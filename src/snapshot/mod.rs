//! # Cart Snapshots
//!
//! Durable, checksummed copies of the cart used to recover after a reload or
//! crash.
//!
//! Snapshots of a session live under one key as a newest-first list capped at
//! `max_snapshots`. A snapshot is only returned when it is younger than
//! `max_age`, its checksum recomputes identically (when validation is on) and
//! its cart is well formed. Storage failures are logged and absorbed; they
//! reduce recovery capability but never block cart operations.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cartsync::shared::config::SnapshotConfig;
//! use cartsync::shared::Cart;
//! use cartsync::snapshot::SnapshotStore;
//! use cartsync::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let snapshots = SnapshotStore::new(Arc::new(MemoryStore::new()), SnapshotConfig::default());
//! snapshots.save_snapshot(&Cart::empty("s1")).await;
//! let recovered = snapshots.load_latest_snapshot("s1").await;
//! # }
//! ```

pub mod checksum;

pub use checksum::cart_checksum;

use crate::offline::queue::{clear_session_records, purge_expired_records};
use crate::offline::reconciliation::reconcile;
use crate::shared::cart::Cart;
use crate::shared::config::SnapshotConfig;
use crate::shared::error::{IntegrityError, PersistenceError};
use crate::storage::{read_json, write_json, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Storage key prefix of snapshot lists, followed by the session id
pub const SNAPSHOT_PREFIX: &str = "cart_snapshots:";

pub fn snapshot_key(session_id: &str) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, session_id)
}

/// A persisted copy of the cart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub cart: Cart,
    pub timestamp: DateTime<Utc>,
    /// Increases by one per save within a session
    pub version: u64,
    pub session_id: String,
    pub checksum: String,
}

/// What a cleanup pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub snapshots_removed: usize,
    pub operations_removed: usize,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    store: Arc<dyn KeyValueStore>,
    config: SnapshotConfig,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: SnapshotConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Save a snapshot, logging instead of returning failures
    pub async fn save_snapshot(&self, cart: &Cart) -> Option<Snapshot> {
        match self.try_save_snapshot(cart).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(session_id = %cart.session_id, error = %e, "Failed to save cart snapshot");
                None
            }
        }
    }

    /// Save a snapshot and prune the session's history to `max_snapshots`
    pub async fn try_save_snapshot(&self, cart: &Cart) -> Result<Snapshot, PersistenceError> {
        let key = snapshot_key(&cart.session_id);
        let mut snapshots = self.read_list(&key).await;
        let version = snapshots.iter().map(|s| s.version).max().unwrap_or(0) + 1;

        let snapshot = Snapshot {
            cart: cart.clone(),
            timestamp: Utc::now(),
            version,
            session_id: cart.session_id.clone(),
            checksum: cart_checksum(cart),
        };
        snapshots.insert(0, snapshot.clone());
        snapshots.truncate(self.config.max_snapshots.max(1));

        match write_json(self.store.as_ref(), &key, &snapshots).await {
            Err(PersistenceError::QuotaExceeded { .. }) if snapshots.len() > 1 => {
                // Out of space: keep only the newest snapshot
                tracing::warn!(session_id = %cart.session_id, "Snapshot quota exceeded, dropping history");
                snapshots.truncate(1);
                write_json(self.store.as_ref(), &key, &snapshots).await?;
            }
            other => other?,
        }

        tracing::debug!(session_id = %cart.session_id, version, "Saved cart snapshot");
        Ok(snapshot)
    }

    /// Snapshots of a session, newest first, without validation
    pub async fn snapshots(&self, session_id: &str) -> Vec<Snapshot> {
        self.read_list(&snapshot_key(session_id)).await
    }

    /// Newest snapshot of the session that passes validation
    pub async fn load_latest_snapshot(&self, session_id: &str) -> Option<Cart> {
        for snapshot in self.snapshots(session_id).await {
            match self.validate(&snapshot, session_id) {
                Ok(()) => return Some(snapshot.cart),
                Err(e) => {
                    tracing::debug!(session_id, version = snapshot.version, reason = %e, "Skipping snapshot");
                }
            }
        }
        None
    }

    /// Check age, checksum and structure of a snapshot
    pub fn validate(&self, snapshot: &Snapshot, session_id: &str) -> Result<(), IntegrityError> {
        let age = (Utc::now() - snapshot.timestamp).to_std().unwrap_or(Duration::ZERO);
        if age > self.config.max_age {
            return Err(IntegrityError::Stale {
                age,
                limit: self.config.max_age,
            });
        }

        if self.config.validate_checksums {
            let computed = cart_checksum(&snapshot.cart);
            if computed != snapshot.checksum {
                return Err(IntegrityError::ChecksumMismatch {
                    stored: snapshot.checksum.clone(),
                    computed,
                });
            }
        }

        for found in [&snapshot.session_id, &snapshot.cart.session_id] {
            if found != session_id {
                return Err(IntegrityError::SessionMismatch {
                    expected: session_id.to_string(),
                    found: found.clone(),
                });
            }
        }

        let cart = &snapshot.cart;
        if cart.total_price < 0 || cart.total_price_with_vat < 0 {
            return Err(IntegrityError::Malformed("negative totals".into()));
        }
        if cart.items.iter().any(|item| item.subtotal < 0 || item.unit_price < 0) {
            return Err(IntegrityError::Malformed("negative line amount".into()));
        }
        if !cart.is_consistent() {
            return Err(IntegrityError::Malformed("totals disagree with items".into()));
        }
        Ok(())
    }

    /// Combine the in-memory cart with the newest valid snapshot.
    ///
    /// An absent or empty current cart is replaced by the snapshot; otherwise
    /// both are merged with the configured strategy. Returns `None` when
    /// there is no usable snapshot.
    pub async fn recover_cart(&self, current: Option<&Cart>, session_id: &str) -> Option<Cart> {
        let recovered = self.load_latest_snapshot(session_id).await?;
        let cart = match current.filter(|cart| !cart.is_empty()) {
            None => recovered,
            Some(current) => reconcile(current, &recovered, self.config.merge_strategy).cart,
        };
        tracing::info!(session_id, items = cart.items.len(), "Recovered cart from snapshot");
        Some(cart)
    }

    /// Forget everything stored for a session
    pub async fn clear_session(&self, session_id: &str) -> Result<(), PersistenceError> {
        self.store.remove(&snapshot_key(session_id)).await?;
        clear_session_records(self.store.as_ref(), session_id).await
    }

    /// Evict snapshots and queued operations older than `max_age`
    pub async fn cleanup(&self) -> Result<CleanupReport, PersistenceError> {
        let mut report = CleanupReport::default();
        let max_age = self.config.max_age;

        for key in self.store.keys(SNAPSHOT_PREFIX).await? {
            let snapshots = self.read_list(&key).await;
            let before = snapshots.len();
            let kept: Vec<Snapshot> = snapshots
                .into_iter()
                .filter(|s| (Utc::now() - s.timestamp).to_std().map_or(true, |age| age <= max_age))
                .collect();
            if kept.len() == before && before > 0 {
                continue;
            }
            report.snapshots_removed += before - kept.len();
            if kept.is_empty() {
                self.store.remove(&key).await?;
            } else {
                write_json(self.store.as_ref(), &key, &kept).await?;
            }
        }

        report.operations_removed = purge_expired_records(self.store.as_ref(), max_age).await?;

        if report != CleanupReport::default() {
            tracing::info!(
                snapshots = report.snapshots_removed,
                operations = report.operations_removed,
                "Removed expired cart records"
            );
        }
        Ok(report)
    }

    /// Read a snapshot list; unreadable data counts as empty
    async fn read_list(&self, key: &str) -> Vec<Snapshot> {
        match read_json(self.store.as_ref(), key).await {
            Ok(list) => list.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(key, error = %e, "Ignoring unreadable snapshots");
                Vec::new()
            }
        }
    }
}
