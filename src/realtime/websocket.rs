use super::core::{ConnectionEnd, Connector, TransportCore};
use super::heartbeat::HeartbeatMonitor;
use super::{RealtimeTransport, TransportEvent, TransportKind, CLIENT_SHUTDOWN_CODE};
use crate::shared::config::TransportConfig;
use crate::shared::error::TransportError;
use crate::shared::event::{ClientMessage, ServerEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Duplex WebSocket transport with heartbeats
pub struct WebSocketTransport {
    core: Arc<TransportCore>,
    connector: Arc<WsConnector>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            core: TransportCore::new(TransportKind::WebSocket, config),
            connector: Arc::new(WsConnector { url: url.into() }),
        }
    }

    pub fn url(&self) -> &str {
        &self.connector.url
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn connect(&self) -> Result<(), TransportError> {
        url::Url::parse(&self.connector.url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        self.core.start(Arc::clone(&self.connector)).await
    }

    fn send(&self, message: ClientMessage) -> bool {
        self.core.send(message)
    }

    fn subscribe_session(&self, session_id: &str) {
        self.core.set_subscription(session_id);
    }

    async fn close(&self) {
        self.core.stop().await;
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
        self.core.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}

struct WsConnector {
    url: String,
}

fn close_details(frame: Option<CloseFrame<'_>>) -> (Option<u16>, String) {
    match frame {
        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
        None => (None, String::new()),
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Connection = WsStream;

    async fn open(&self, _core: &TransportCore) -> Result<WsStream, TransportError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(stream)
    }

    async fn run(&self, stream: WsStream, core: &TransportCore, cancel: &CancellationToken) -> ConnectionEnd {
        let (mut sink, mut source) = stream.split();
        let mut outbound = core.install_outbound();

        if let Some(session_id) = core.subscription() {
            core.send(ClientMessage::Subscribe { session_id });
        }

        let period = core.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut monitor = HeartbeatMonitor::new(period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::from(CLIENT_SHUTDOWN_CODE),
                        reason: "client shutting down".into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        tracing::debug!(error = %e, "Failed to send close frame");
                    }
                    return ConnectionEnd::Shutdown;
                }

                Some(message) = outbound.recv() => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to encode client message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        core.emit(TransportEvent::Error(TransportError::Protocol(e.to_string())));
                        return ConnectionEnd::Lost { code: None, reason: e.to_string() };
                    }
                }

                _ = heartbeat.tick() => {
                    if monitor.is_expired(Instant::now()) {
                        let error = TransportError::HeartbeatTimeout(monitor.grace());
                        core.emit(TransportEvent::Error(error.clone()));
                        let _ = sink.send(Message::Close(None)).await;
                        return ConnectionEnd::Lost { code: None, reason: error.to_string() };
                    }
                    if let Ok(text) = ClientMessage::ping().to_json() {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            return ConnectionEnd::Lost { code: None, reason: e.to_string() };
                        }
                    }
                }

                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        monitor.record();
                        match ServerEvent::from_json(&text) {
                            Ok(event) if event.is_heartbeat() => {}
                            Ok(event) => core.emit(TransportEvent::Message(event)),
                            Err(e) => tracing::warn!(error = %e, "Dropping undecodable realtime message"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = close_details(frame);
                        return if code == Some(CLIENT_SHUTDOWN_CODE) {
                            ConnectionEnd::Finished { code, reason }
                        } else {
                            ConnectionEnd::Lost { code, reason }
                        };
                    }
                    Some(Ok(_)) => monitor.record(),
                    Some(Err(e)) => {
                        core.emit(TransportEvent::Error(TransportError::Protocol(e.to_string())));
                        return ConnectionEnd::Lost { code: None, reason: e.to_string() };
                    }
                    None => {
                        return ConnectionEnd::Lost { code: None, reason: "connection dropped".into() };
                    }
                },
            }
        }
    }
}
