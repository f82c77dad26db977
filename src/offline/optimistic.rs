//! # Optimistic Mutation Manager
//!
//! Applies cart mutations locally before the server confirms them.
//!
//! The manager keeps the last authoritative cart (what the server last said)
//! and an ordered list of pending operations. The effective state shown to
//! the user is always the pending operations replayed, in issuance order, on
//! top of the authoritative cart. That makes confirmation and rollback the
//! same computation:
//!
//! - **Confirm**: the server result becomes the authoritative cart and the
//!   operation leaves the pending list
//! - **Fail**: the operation leaves the pending list; the remaining ones are
//!   replayed on the unchanged authoritative cart
//!
//! When two pending operations touch the same product, replay order decides
//! the outcome. There is no last-write-wins shortcut.
//!
//! ## Usage
//!
//! ```rust
//! use cartsync::offline::OptimisticManager;
//! use cartsync::shared::config::OptimisticConfig;
//! use cartsync::shared::{Cart, CartMutation};
//!
//! let mut manager = OptimisticManager::new(Cart::empty("s1"), &OptimisticConfig::default());
//! let applied = manager
//!     .apply_optimistic_update(CartMutation::AddItem {
//!         product_id: "book".into(),
//!         quantity: 1,
//!         unit_price: 1_000,
//!     })
//!     .unwrap();
//! assert_eq!(applied.new_state.total_items, 1);
//!
//! let server_cart = applied.new_state.clone();
//! manager.confirm_operation(applied.operation_id, server_cart).unwrap();
//! assert_eq!(manager.pending_count(), 0);
//! ```

use crate::shared::cart::Cart;
use crate::shared::config::OptimisticConfig;
use crate::shared::error::{ApiError, CartError};
use crate::shared::mutation::{CartMutation, OperationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an optimistic operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Applied locally, awaiting the server
    Pending,
    /// Acknowledged by the server
    Confirmed,
    /// Rejected or out of retries
    Failed,
}

/// A mutation applied locally and not yet confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Unique operation ID, generated at apply time
    pub id: Uuid,
    pub mutation: CartMutation,
    /// Effective cart right before this operation was applied
    pub original_state: Cart,
    pub retries: u32,
    pub max_retries: u32,
    pub status: OperationStatus,
    pub applied_at: DateTime<Utc>,
}

impl PendingOperation {
    pub fn kind(&self) -> OperationType {
        self.mutation.kind()
    }

    /// Whether another retry fits in the budget
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }
}

/// Result of applying an operation tentatively
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpdate {
    pub operation_id: Uuid,
    /// Effective cart including the new operation
    pub new_state: Cart,
}

/// Result of failing an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollback {
    /// The failed operation, with status `Failed`
    pub operation: PendingOperation,
    /// Effective cart without the failed operation
    pub state: Cart,
    /// Why it failed
    pub error: ApiError,
}

/// Optimistic update manager
#[derive(Debug)]
pub struct OptimisticManager {
    /// Last state acknowledged by the server
    authoritative: Cart,
    /// In-flight operations in issuance order
    pending: Vec<PendingOperation>,
    max_pending: usize,
    max_retries: u32,
}

impl OptimisticManager {
    /// Create a manager on top of an authoritative cart
    pub fn new(initial: Cart, config: &OptimisticConfig) -> Self {
        Self {
            authoritative: initial,
            pending: Vec::new(),
            max_pending: config.max_pending_operations,
            max_retries: config.max_retries,
        }
    }

    /// Apply a mutation tentatively with a freshly generated id
    pub fn apply_optimistic_update(&mut self, mutation: CartMutation) -> Result<AppliedUpdate, CartError> {
        self.apply_with_id(Uuid::new_v4(), mutation)
    }

    /// Apply a mutation tentatively under a caller-chosen id
    pub fn apply_with_id(&mut self, id: Uuid, mutation: CartMutation) -> Result<AppliedUpdate, CartError> {
        if self.pending.len() >= self.max_pending {
            return Err(CartError::PendingLimit(self.max_pending));
        }

        let original_state = self.current_state();
        let new_state = mutation.apply_to(&original_state);

        tracing::debug!(
            operation_id = %id,
            kind = %mutation.kind(),
            pending = self.pending.len() + 1,
            "Applied optimistic update"
        );

        self.pending.push(PendingOperation {
            id,
            mutation,
            original_state,
            retries: 0,
            max_retries: self.max_retries,
            status: OperationStatus::Pending,
            applied_at: Utc::now(),
        });

        Ok(AppliedUpdate {
            operation_id: id,
            new_state,
        })
    }

    /// Accept the server result for an operation
    pub fn confirm_operation(&mut self, operation_id: Uuid, server_result: Cart) -> Result<PendingOperation, CartError> {
        let mut operation = self.take(operation_id)?;
        operation.status = OperationStatus::Confirmed;
        self.authoritative = server_result;
        tracing::debug!(%operation_id, "Confirmed optimistic update");
        Ok(operation)
    }

    /// Drop a failed operation and recompute the effective state
    pub fn fail_operation(&mut self, operation_id: Uuid, error: ApiError) -> Result<Rollback, CartError> {
        let mut operation = self.take(operation_id)?;
        operation.status = OperationStatus::Failed;
        let state = self.current_state();
        tracing::debug!(%operation_id, %error, "Rolled back optimistic update");
        Ok(Rollback {
            operation,
            state,
            error,
        })
    }

    /// Count a retry; returns whether the operation may be retried again
    pub fn record_retry(&mut self, operation_id: Uuid) -> Result<bool, CartError> {
        let operation = self
            .pending
            .iter_mut()
            .find(|op| op.id == operation_id)
            .ok_or(CartError::UnknownOperation(operation_id))?;
        if !operation.can_retry() {
            return Ok(false);
        }
        operation.retries += 1;
        Ok(true)
    }

    /// Pending operations replayed on the authoritative cart
    pub fn current_state(&self) -> Cart {
        self.pending
            .iter()
            .fold(self.authoritative.clone(), |cart, op| op.mutation.apply_to(&cart))
    }

    pub fn authoritative_state(&self) -> &Cart {
        &self.authoritative
    }

    /// Replace the authoritative cart without touching pending operations,
    /// e.g. after a server push or a message from another replica
    pub fn set_authoritative(&mut self, cart: Cart) {
        self.authoritative = cart;
    }

    pub fn pending_operations(&self) -> &[PendingOperation] {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, operation_id: Uuid) -> Option<&PendingOperation> {
        self.pending.iter().find(|op| op.id == operation_id)
    }

    pub fn has_capacity(&self) -> bool {
        self.pending.len() < self.max_pending
    }

    /// Forget every pending operation and start from `cart`
    pub fn reset(&mut self, cart: Cart) {
        if !self.pending.is_empty() {
            tracing::debug!(dropped = self.pending.len(), "Reset optimistic state");
        }
        self.pending.clear();
        self.authoritative = cart;
    }

    fn take(&mut self, operation_id: Uuid) -> Result<PendingOperation, CartError> {
        let index = self
            .pending
            .iter()
            .position(|op| op.id == operation_id)
            .ok_or(CartError::UnknownOperation(operation_id))?;
        Ok(self.pending.remove(index))
    }
}
