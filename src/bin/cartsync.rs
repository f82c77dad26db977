//! Headless cart sync client.
//!
//! Builds a session from `CARTSYNC_*` environment variables (a `.env` file in
//! the working directory is loaded first), recovers the
//! cart, connects the realtime transport and logs every status change until
//! Ctrl-C.

use cartsync::session::{CartSession, SessionParts};
use cartsync::shared::SyncConfig;
use cartsync::storage::{KeyValueStore, SqliteStore};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let config = SyncConfig::from_env()?;
    let db_path = config.resolved_data_dir().join("cartsync.db");
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&db_path).await?);
    tracing::info!(api = %config.api_url, db = %db_path.display(), "Starting cart sync client");

    let parts = SessionParts::from_config(&config, store)?;
    let session = CartSession::new(config, parts)?;

    let recovered = session.recover().await;
    tracing::info!(
        session_id = %session.session_id(),
        items = recovered.total_items,
        "Recovered cart"
    );
    if let Err(e) = session.refresh_cart().await {
        tracing::warn!(error = %e, "Starting from the local cart");
    }
    if let Err(e) = session.connect().await {
        tracing::warn!(error = %e, "Realtime updates unavailable for now");
    }

    let mut status = session.watch();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                tracing::info!(
                    connection = %current.connection_status,
                    network = ?current.network,
                    items = current.cart.total_items,
                    total = current.cart.total_price_with_vat,
                    pending = current.pending_operations,
                    queued = current.queued_operations,
                    error = ?current.last_error,
                    "Cart status"
                );
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
