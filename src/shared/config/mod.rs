//! Sync engine configuration
//!
//! [`SyncConfig`] groups the tunables of every component. Build it with
//! [`SyncConfig::builder`] or load it from the environment with
//! [`SyncConfig::from_env`]. [`SyncConfig::from_env_file`] reads a dotenv
//! file first; variables already set in the process win.

use crate::offline::reconciliation::MergeStrategy;
use crate::shared::cart::DEFAULT_VAT_RATE_BPS;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default Cart API base URL
const DEFAULT_API_URL: &str = "http://127.0.0.1:3000";

/// Realtime transport settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Duplex WebSocket endpoint
    pub realtime_url: Option<String>,
    /// Push-only server-sent events endpoint
    pub events_url: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            realtime_url: None,
            events_url: None,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

/// Optimistic mutation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticConfig {
    /// Operations allowed in flight at once
    pub max_pending_operations: usize,
    /// Retries of transient failures before an operation fails for good
    pub max_retries: u32,
    /// Time allowed for the server to confirm one operation
    pub confirmation_timeout: Duration,
    /// Delay before the first retry of a transient failure; later retries
    /// back off exponentially
    pub retry_delay: Duration,
    /// Longest delay between two retries
    pub max_retry_delay: Duration,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            max_pending_operations: 10,
            max_retries: 3,
            confirmation_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(8),
        }
    }
}

/// Snapshot store settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Snapshots kept per session
    pub max_snapshots: usize,
    /// Oldest snapshot usable for recovery
    pub max_age: Duration,
    pub validate_checksums: bool,
    pub merge_strategy: MergeStrategy,
    /// Period of the background snapshot
    pub snapshot_interval: Duration,
    /// Period of the background cleanup
    pub cleanup_interval: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 10,
            max_age: Duration::from_secs(24 * 60 * 60),
            validate_checksums: true,
            merge_strategy: MergeStrategy::MergeItems,
            snapshot_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Cross-replica broadcast settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Name shared by every replica of a session
    pub channel_name: String,
    pub debounce: Duration,
    /// Messages older than this are dropped on receipt
    pub staleness_window: Duration,
    /// Drop messages that come back to the replica that sent them
    pub suppress_self_echo: bool,
    /// Entries kept in the storage-backed message log
    pub storage_log_limit: usize,
    /// Period of the storage log trim
    pub trim_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_name: "cart-sync".to_string(),
            debounce: Duration::from_millis(100),
            staleness_window: Duration::from_secs(5),
            suppress_self_echo: true,
            storage_log_limit: 50,
            trim_interval: Duration::from_secs(10),
        }
    }
}

/// Offline queue settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineConfig {
    /// Replay attempts per operation before it is dropped
    pub max_retries: u32,
    /// Applied operation ids remembered for idempotent replay
    pub applied_ledger_size: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            applied_ledger_size: 256,
        }
    }
}

/// Complete configuration of a cart session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Remote Cart API base URL
    pub api_url: String,
    /// Session to resume; a fresh one is generated when absent
    pub session_id: Option<String>,
    /// Directory of the durable store
    pub data_dir: Option<PathBuf>,
    /// VAT applied to locally computed totals
    pub vat_rate_bps: u32,
    pub transport: TransportConfig,
    pub optimistic: OptimisticConfig,
    pub snapshot: SnapshotConfig,
    pub broadcast: BroadcastConfig,
    pub offline: OfflineConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            session_id: None,
            data_dir: None,
            vat_rate_bps: DEFAULT_VAT_RATE_BPS,
            transport: TransportConfig::default(),
            optimistic: OptimisticConfig::default(),
            snapshot: SnapshotConfig::default(),
            broadcast: BroadcastConfig::default(),
            offline: OfflineConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create a new SyncConfigBuilder
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Read `CARTSYNC_*` environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        if let Ok(url) = std::env::var("CARTSYNC_API_URL") {
            builder = builder.api_url(url);
        }
        if let Ok(url) = std::env::var("CARTSYNC_REALTIME_URL") {
            builder = builder.realtime_url(url);
        }
        if let Ok(url) = std::env::var("CARTSYNC_EVENTS_URL") {
            builder = builder.events_url(url);
        }
        if let Ok(session_id) = std::env::var("CARTSYNC_SESSION_ID") {
            builder = builder.session_id(session_id);
        }
        if let Ok(dir) = std::env::var("CARTSYNC_DATA_DIR") {
            builder = builder.data_dir(PathBuf::from(dir));
        }
        if let Ok(rate) = std::env::var("CARTSYNC_VAT_RATE_BPS") {
            let rate = rate
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidValue("CARTSYNC_VAT_RATE_BPS", rate))?;
            builder = builder.vat_rate_bps(rate);
        }
        builder.build()
    }

    /// Load `path` into the process environment, then [`Self::from_env`]
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenv::from_path(path.as_ref()).map_err(|e| ConfigError::EnvFile(e.to_string()))?;
        Self::from_env()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url(&self.api_url, &["http", "https"])?;
        if let Some(url) = &self.transport.realtime_url {
            check_url(url, &["ws", "wss"])?;
        }
        if let Some(url) = &self.transport.events_url {
            check_url(url, &["http", "https"])?;
        }
        if self.optimistic.max_pending_operations == 0 {
            return Err(ConfigError::InvalidValue(
                "max_pending_operations",
                "0".to_string(),
            ));
        }
        if self.snapshot.max_snapshots == 0 {
            return Err(ConfigError::InvalidValue("max_snapshots", "0".to_string()));
        }
        if self.transport.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval",
                "0s".to_string(),
            ));
        }
        if self.broadcast.channel_name.is_empty() {
            return Err(ConfigError::MissingValue("broadcast.channel_name"));
        }
        Ok(())
    }

    /// Directory of the durable store, falling back to the platform data dir
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
            path.push("cartsync");
            path
        })
    }
}

fn check_url(raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|_| ConfigError::InvalidUrl(raw.to_string()))?;
    if schemes.contains(&parsed.scheme()) {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl(raw.to_string()))
    }
}

/// Builder for SyncConfig
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn realtime_url(mut self, url: impl Into<String>) -> Self {
        self.config.transport.realtime_url = Some(url.into());
        self
    }

    pub fn events_url(mut self, url: impl Into<String>) -> Self {
        self.config.transport.events_url = Some(url.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.config.session_id = Some(session_id.into());
        self
    }

    pub fn data_dir(mut self, dir: PathBuf) -> Self {
        self.config.data_dir = Some(dir);
        self
    }

    pub fn vat_rate_bps(mut self, rate: u32) -> Self {
        self.config.vat_rate_bps = rate;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    pub fn optimistic(mut self, optimistic: OptimisticConfig) -> Self {
        self.config.optimistic = optimistic;
        self
    }

    pub fn snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.config.snapshot = snapshot;
        self
    }

    pub fn broadcast(mut self, broadcast: BroadcastConfig) -> Self {
        self.config.broadcast = broadcast;
        self
    }

    pub fn offline(mut self, offline: OfflineConfig) -> Self {
        self.config.offline = offline;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
    #[error("cannot load env file: {0}")]
    EnvFile(String),
}
