//! Connection supervision shared by both transports.
//!
//! A supervisor task opens the connection, runs it until it ends and then
//! reconnects on a fixed schedule until the attempt cap is hit. The first
//! handshake outcome is reported back to `connect()`.

use super::{TransportEvent, TransportKind, CLIENT_SHUTDOWN_CODE};
use crate::offline::retry::{RetryPolicy, RetryState};
use crate::shared::config::TransportConfig;
use crate::shared::error::TransportError;
use crate::shared::event::ClientMessage;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// Why a connection stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectionEnd {
    /// `close()` was called
    Shutdown,
    /// The server closed normally; no reconnect
    Finished { code: Option<u16>, reason: String },
    /// Dropped or timed out; reconnect
    Lost { code: Option<u16>, reason: String },
}

/// How one transport opens and drives a single connection
#[async_trait]
pub(crate) trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn open(&self, core: &TransportCore) -> Result<Self::Connection, TransportError>;

    async fn run(&self, connection: Self::Connection, core: &TransportCore, cancel: &CancellationToken) -> ConnectionEnd;
}

/// State shared between a transport handle and its supervisor task
pub(crate) struct TransportCore {
    pub kind: TransportKind,
    pub config: TransportConfig,
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    cancel: Mutex<CancellationToken>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    subscription: RwLock<Option<String>>,
}

impl TransportCore {
    pub fn new(kind: TransportKind, config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            kind,
            config,
            events: broadcast::channel(EVENT_CAPACITY).0,
            connected: AtomicBool::new(false),
            outbound: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            supervisor: Mutex::new(None),
            subscription: RwLock::new(None),
        })
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscription(&self) -> Option<String> {
        self.subscription.read().clone()
    }

    /// Remember the session to subscribe to on every (re)connect, and
    /// subscribe now when connected
    pub fn set_subscription(&self, session_id: &str) {
        *self.subscription.write() = Some(session_id.to_string());
        self.send(ClientMessage::Subscribe {
            session_id: session_id.to_string(),
        });
    }

    /// Open a fresh outbound queue for a new connection
    pub fn install_outbound(&self) -> mpsc::UnboundedReceiver<ClientMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        rx
    }

    pub fn send(&self, message: ClientMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Start supervising `connector` and wait for the first handshake.
    ///
    /// A failed first handshake is returned as an error while the
    /// supervisor keeps reconnecting in the background.
    pub async fn start<C: Connector>(self: &Arc<Self>, connector: Arc<C>) -> Result<(), TransportError> {
        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut supervisor = self.supervisor.lock();
            if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return if self.is_connected() {
                    Ok(())
                } else {
                    Err(TransportError::Connect("connection attempt already in progress".into()))
                };
            }
            let cancel = CancellationToken::new();
            *self.cancel.lock() = cancel.clone();
            *supervisor = Some(tokio::spawn(supervise(Arc::clone(self), connector, cancel, first_tx)));
        }
        first_rx.await.unwrap_or(Err(TransportError::Closed))
    }

    /// Cancel the supervisor and wait for it to finish
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Transport supervisor ended abnormally");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        *self.outbound.lock() = None;
    }
}

async fn supervise<C: Connector>(
    core: Arc<TransportCore>,
    connector: Arc<C>,
    cancel: CancellationToken,
    first: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut first = Some(first);
    let mut retry = RetryState::new(RetryPolicy::fixed(
        core.config.reconnect_interval,
        core.config.max_reconnect_attempts,
    ));
    let handshake_timeout = core.config.handshake_timeout;

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = tokio::time::timeout(handshake_timeout, connector.open(&core)) => opened,
        };

        match opened.unwrap_or(Err(TransportError::HandshakeTimeout(handshake_timeout))) {
            Ok(connection) => {
                let reconnected = retry.attempt() > 0;
                retry.reset();
                core.connected.store(true, Ordering::SeqCst);
                tracing::info!(kind = ?core.kind, "Realtime connection opened");
                core.emit(TransportEvent::Opened);
                if reconnected {
                    core.emit(TransportEvent::Reconnected);
                }
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }

                let end = connector.run(connection, &core, &cancel).await;
                core.connected.store(false, Ordering::SeqCst);
                *core.outbound.lock() = None;

                match end {
                    ConnectionEnd::Shutdown => {
                        core.emit(TransportEvent::Closed {
                            code: Some(CLIENT_SHUTDOWN_CODE),
                            reason: "client shutting down".into(),
                        });
                        break;
                    }
                    ConnectionEnd::Finished { code, reason } => {
                        tracing::info!(kind = ?core.kind, ?code, %reason, "Realtime connection closed by server");
                        core.emit(TransportEvent::Closed { code, reason });
                        break;
                    }
                    ConnectionEnd::Lost { code, reason } => {
                        tracing::warn!(kind = ?core.kind, ?code, %reason, "Realtime connection lost");
                        core.emit(TransportEvent::Closed { code, reason });
                    }
                }
            }
            Err(error) => {
                tracing::warn!(kind = ?core.kind, error = %error, "Realtime connection attempt failed");
                core.emit(TransportEvent::Error(error.clone()));
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(error));
                }
            }
        }

        let Some(delay) = retry.next_delay() else {
            let attempts = core.config.max_reconnect_attempts;
            tracing::error!(kind = ?core.kind, attempts, "Giving up on realtime reconnection");
            core.emit(TransportEvent::Error(TransportError::MaxAttemptsReached(attempts)));
            core.emit(TransportEvent::MaxAttemptsReached { attempts });
            break;
        };
        let attempt = retry.attempt();
        tracing::info!(kind = ?core.kind, attempt, ?delay, "Reconnecting");
        core.emit(TransportEvent::Reconnecting { attempt });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    core.connected.store(false, Ordering::SeqCst);
    if let Some(tx) = first.take() {
        let _ = tx.send(Err(TransportError::Closed));
    }
}
