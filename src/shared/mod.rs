//! Shared Module
//!
//! Types used by every component of the sync engine: the cart data model,
//! mutations, realtime wire messages, error types and configuration.

/// Cart data model
pub mod cart;

/// Cart mutations and their replay semantics
pub mod mutation;

/// Realtime wire messages
pub mod event;

/// Error types
pub mod error;

/// Sync engine configuration
pub mod config;

/// Re-export commonly used types for convenience
pub use cart::{Cart, CartItem, StockWarning};
pub use config::{ConfigError, SyncConfig, SyncConfigBuilder};
pub use error::{ApiError, BroadcastError, CartError, IntegrityError, PersistenceError, TransportError};
pub use event::{ClientMessage, ServerEvent};
pub use mutation::{CartMutation, OperationType};
