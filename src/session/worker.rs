//! Mutation worker: the only caller of mutating Cart API endpoints.
//!
//! Commands arrive in issuance order and are sent one at a time, so the
//! server sees mutations in the order the optimistic state applied them.

use super::{Inner, MutationOutcome};
use crate::offline::retry::{RetryPolicy, RetryState};
use crate::shared::cart::Cart;
use crate::shared::error::{ApiError, CartError};
use crate::shared::mutation::CartMutation;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use uuid::Uuid;

pub(super) struct Command {
    pub(super) id: Uuid,
    /// Session at issuance
    pub(super) session_id: String,
    pub(super) mutation: CartMutation,
    pub(super) reply: oneshot::Sender<Result<MutationOutcome, CartError>>,
    /// Held until the operation leaves the pending set
    pub(super) permit: OwnedSemaphorePermit,
}

pub(super) async fn run(inner: Arc<Inner>, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        let command = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        let Command {
            id,
            session_id,
            mutation,
            reply,
            permit,
        } = command;

        let outcome = tokio::select! {
            _ = inner.cancel.cancelled() => Err(CartError::SessionClosed),
            outcome = process(&inner, id, &session_id, &mutation) => outcome,
        };
        drop(permit);
        if reply.send(outcome).is_err() {
            tracing::debug!(operation_id = %id, "Mutation caller went away");
        }
    }
    tracing::debug!("Mutation worker stopped");
}

async fn process(
    inner: &Inner,
    id: Uuid,
    session_id: &str,
    mutation: &CartMutation,
) -> Result<MutationOutcome, CartError> {
    // Offline mutations were issued first and must reach the server first
    if inner.has_queued() {
        inner.drain_offline().await;
        if inner.has_queued() {
            return enqueue_behind(inner, id, session_id, mutation).await;
        }
    }

    let optimistic = &inner.config.optimistic;
    let mut backoff = RetryState::new(RetryPolicy::exponential(
        optimistic.retry_delay,
        optimistic.max_retry_delay,
        optimistic.max_retries,
    ));

    loop {
        let call = inner.api.execute(session_id, mutation);
        let result = match tokio::time::timeout(optimistic.confirmation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        };
        let error = match result {
            Ok(cart) => return Ok(confirm(inner, id, session_id, mutation, cart).await),
            Err(error) => error,
        };

        if error.is_connectivity() {
            return defer(inner, id, session_id, mutation, error).await;
        }
        // A timed out request may still have been applied, so it is not resent.
        if error.is_transient() && error != ApiError::Timeout {
            let retry = inner.manager.lock().record_retry(id);
            match (retry, backoff.next_delay()) {
                (Ok(true), Some(delay)) => {
                    tracing::warn!(
                        operation_id = %id,
                        kind = %mutation.kind(),
                        attempt = backoff.attempt(),
                        error = %error,
                        "Transient mutation failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                (Ok(_), _) => {
                    let retries = inner.manager.lock().get(id).map_or(0, |op| op.retries);
                    return Err(reject(inner, id, error, Some(retries)));
                }
                (Err(_), _) => return Err(reject(inner, id, error, None)),
            }
        }
        return Err(reject(inner, id, error, None));
    }
}

async fn confirm(inner: &Inner, id: Uuid, session_id: &str, mutation: &CartMutation, cart: Cart) -> MutationOutcome {
    if inner.session_id() != session_id {
        tracing::debug!(operation_id = %id, "Confirmation for a previous session");
        return MutationOutcome::Applied(inner.visible_cart());
    }
    if let Err(e) = inner.manager.lock().confirm_operation(id, cart.clone()) {
        tracing::debug!(operation_id = %id, error = %e, "Confirmed operation was no longer pending");
    }

    inner.snapshots.save_snapshot(&cart).await;
    announce(inner, mutation, &cart, session_id);
    inner.mark_online();
    inner.mark_synced();

    tracing::debug!(operation_id = %id, kind = %mutation.kind(), "Mutation confirmed");
    MutationOutcome::Applied(inner.visible_cart())
}

/// Tell the other replicas what changed
fn announce(inner: &Inner, mutation: &CartMutation, cart: &Cart, session_id: &str) {
    let broadcast = &inner.broadcast;
    match mutation {
        CartMutation::AddItem {
            product_id, quantity, ..
        } => broadcast.broadcast_item_added(product_id, *quantity, cart, session_id),
        CartMutation::UpdateQuantity { product_id, quantity } => {
            broadcast.broadcast_quantity_update(product_id, *quantity, cart, session_id)
        }
        CartMutation::RemoveItem { product_id } => broadcast.broadcast_item_removed(product_id, cart, session_id),
        CartMutation::ClearCart => broadcast.broadcast_cart_clear(session_id),
    }
}

/// Roll back and move the mutation to the offline queue
async fn defer(
    inner: &Inner,
    id: Uuid,
    session_id: &str,
    mutation: &CartMutation,
    error: ApiError,
) -> Result<MutationOutcome, CartError> {
    let rollback = inner.manager.lock().fail_operation(id, error.clone());
    if rollback.is_err() || inner.session_id() != session_id {
        return Err(CartError::Rejected {
            operation_id: id,
            source: error,
        });
    }
    inner.mark_offline();

    let outcome = queue(inner, id, mutation, &error).await?;
    tracing::info!(operation_id = %id, kind = %mutation.kind(), "Server unreachable, mutation queued");
    Ok(outcome)
}

/// Queue the mutation after offline ones that could not be replayed yet
async fn enqueue_behind(
    inner: &Inner,
    id: Uuid,
    session_id: &str,
    mutation: &CartMutation,
) -> Result<MutationOutcome, CartError> {
    let error = ApiError::offline("earlier offline mutations are still waiting");
    let rollback = inner.manager.lock().fail_operation(id, error.clone());
    if rollback.is_err() || inner.session_id() != session_id {
        return Err(CartError::Rejected {
            operation_id: id,
            source: error,
        });
    }

    let outcome = queue(inner, id, mutation, &error).await?;
    tracing::info!(operation_id = %id, kind = %mutation.kind(), "Offline queue not drained, mutation queued behind it");
    Ok(outcome)
}

async fn queue(inner: &Inner, id: Uuid, mutation: &CartMutation, error: &ApiError) -> Result<MutationOutcome, CartError> {
    if let Err(e) = inner.queue.queue_operation(id, mutation.clone()).await {
        tracing::error!(operation_id = %id, error = %e, "Could not queue mutation for offline replay");
        inner.publish_with(|status| status.last_error = Some(e.to_string()));
        return Err(CartError::Rejected {
            operation_id: id,
            source: error.clone(),
        });
    }
    inner.reload_queued().await;
    inner.publish_with(|status| status.last_error = Some(error.to_string()));

    Ok(MutationOutcome::Queued {
        operation_id: id,
        cart: inner.visible_cart(),
    })
}

fn reject(inner: &Inner, id: Uuid, error: ApiError, retries: Option<u32>) -> CartError {
    if let Err(e) = inner.manager.lock().fail_operation(id, error.clone()) {
        tracing::debug!(operation_id = %id, error = %e, "Rejected operation was no longer pending");
    }
    tracing::warn!(operation_id = %id, error = %error, "Mutation failed, rolled back");
    inner.publish_with(|status| status.last_error = Some(error.to_string()));

    match retries {
        Some(retries) => CartError::RetriesExhausted {
            operation_id: id,
            retries,
            source: error,
        },
        None => CartError::Rejected {
            operation_id: id,
            source: error,
        },
    }
}
