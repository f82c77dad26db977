//! Sync Engine Error Types
//!
//! One error enum per layer of the sync engine. Each layer absorbs its own
//! failures except mutation errors, which reach the caller.
//!
//! # Error Categories
//!
//! - `TransportError` - connection and heartbeat failures, recovered by
//!   reconnecting or switching to the fallback transport
//! - `ApiError` - failures of the remote Cart API
//! - `CartError` - what the presentation layer sees when a mutation fails
//! - `PersistenceError` - storage read/write failures, logged and absorbed
//! - `IntegrityError` - stale or corrupt snapshots and broadcast messages,
//!   discarded silently
//! - `BroadcastError` - cross-replica post failures, reported to the error
//!   handler
//!
//! Being queued while offline is not an error; see
//! [`MutationOutcome`](crate::session::MutationOutcome).
//!
//! # Usage
//!
//! ```rust
//! use cartsync::shared::error::ApiError;
//!
//! let error = ApiError::offline("connection refused");
//! assert!(error.is_connectivity());
//! ```
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Realtime transport failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint could not be reached or refused the upgrade
    #[error("connection failed: {0}")]
    Connect(String),

    /// No handshake within the configured window
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The peer stopped answering heartbeats
    #[error("no heartbeat reply within {0:?}")]
    HeartbeatTimeout(Duration),

    /// Frame-level failure on an open connection
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reconnection gave up
    #[error("reconnection abandoned after {0} attempts")]
    MaxAttemptsReached(u32),

    /// The transport was closed by the client
    #[error("transport closed")]
    Closed,

    #[error("invalid endpoint: {0}")]
    InvalidUrl(String),
}

/// Remote Cart API failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The server could not be reached at all
    #[error("server unreachable: {0}")]
    Offline(String),

    /// The request did not complete in time
    #[error("request timed out")]
    Timeout,

    /// The server answered with an error status
    #[error("server rejected request ({status}): {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Body or reason phrase
        message: String,
    },

    /// The response body was not a cart
    #[error("malformed response: {0}")]
    Decode(String),

    /// The configured base URL cannot carry API routes
    #[error("invalid API URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    pub fn offline(message: impl Into<String>) -> Self {
        Self::Offline(message.into())
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Failures caused by missing connectivity; these defer the mutation to
    /// the offline queue instead of surfacing it.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ApiError::Offline(_))
    }

    /// Failures worth retrying while the connection is up
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Timeout => true,
            ApiError::Rejected { status, .. } => *status == 429 || *status >= 500,
            ApiError::Offline(_) | ApiError::Decode(_) | ApiError::InvalidUrl(_) => false,
        }
    }
}

/// Mutation failures surfaced to the presentation layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CartError {
    /// The server refused the change; the optimistic state was rolled back
    #[error("mutation {operation_id} rejected: {source}")]
    Rejected {
        operation_id: Uuid,
        #[source]
        source: ApiError,
    },

    /// Transient failures outlasted the retry budget
    #[error("mutation {operation_id} failed after {retries} retries: {source}")]
    RetriesExhausted {
        operation_id: Uuid,
        retries: u32,
        #[source]
        source: ApiError,
    },

    /// Too many operations awaiting confirmation
    #[error("too many pending operations (limit {0})")]
    PendingLimit(usize),

    /// No pending operation with this id
    #[error("unknown operation {0}")]
    UnknownOperation(Uuid),

    /// The session controller has shut down
    #[error("cart session is closed")]
    SessionClosed,

    /// A read-side API call failed
    #[error("cart request failed: {0}")]
    Api(#[from] ApiError),
}

/// Local storage failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Underlying store reported an error
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// Writing would exceed the store's capacity
    #[error("storage quota exceeded: {needed} bytes requested, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    /// A record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Reasons a snapshot or broadcast message is discarded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("artifact is {age:?} old, limit is {limit:?}")]
    Stale { age: Duration, limit: Duration },

    #[error("checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },

    #[error("session mismatch: expected {expected}, found {found}")]
    SessionMismatch { expected: String, found: String },

    #[error("malformed artifact: {0}")]
    Malformed(String),
}

/// Cross-replica broadcast failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// Nobody can receive on this channel any more
    #[error("broadcast channel closed")]
    Closed,

    #[error("failed to post broadcast: {0}")]
    Post(String),

    #[error("broadcast storage failure: {0}")]
    Storage(#[from] PersistenceError),
}

impl From<serde_json::Error> for BroadcastError {
    fn from(err: serde_json::Error) -> Self {
        Self::Post(err.to_string())
    }
}
