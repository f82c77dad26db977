use super::core::{ConnectionEnd, Connector, TransportCore};
use super::{RealtimeTransport, TransportEvent, TransportKind};
use crate::shared::config::TransportConfig;
use crate::shared::error::TransportError;
use crate::shared::event::{ClientMessage, ServerEvent};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One dispatched server-sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Raw bytes of the unfinished line; a chunk may end inside a UTF-8 sequence
    buffer: Vec<u8>,
    pending: SseFrame,
    has_data: bool,
}

impl SseDecoder {
    /// Feed a chunk and return every event it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if self.has_data {
                    frames.push(std::mem::take(&mut self.pending));
                } else {
                    self.pending = SseFrame::default();
                }
                self.has_data = false;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => {
                    if self.has_data {
                        self.pending.data.push('\n');
                    }
                    self.pending.data.push_str(value);
                    self.has_data = true;
                }
                "event" => self.pending.event = Some(value.to_string()),
                "id" => self.pending.id = Some(value.to_string()),
                _ => {}
            }
        }
        frames
    }
}

/// Push-only fallback transport over server-sent events.
///
/// There is no client to server channel: `send` always returns `false`.
pub struct EventSourceTransport {
    core: Arc<TransportCore>,
    connector: Arc<SseConnector>,
}

impl EventSourceTransport {
    pub fn new(url: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            core: TransportCore::new(TransportKind::EventSource, config),
            connector: Arc::new(SseConnector {
                url: url.into(),
                client: Client::new(),
            }),
        }
    }
}

#[async_trait]
impl RealtimeTransport for EventSourceTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventSource
    }

    async fn connect(&self) -> Result<(), TransportError> {
        url::Url::parse(&self.connector.url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        self.core.start(Arc::clone(&self.connector)).await
    }

    fn send(&self, _message: ClientMessage) -> bool {
        false
    }

    fn subscribe_session(&self, session_id: &str) {
        // Scoping is carried by the URL
        tracing::debug!(session_id, "Event stream session is fixed by its URL");
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

struct SseConnector {
    url: String,
    client: Client,
}

#[async_trait]
impl Connector for SseConnector {
    type Connection = Response;

    async fn open(&self, _core: &TransportCore) -> Result<Response, TransportError> {
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Connect(format!("unexpected status {}", status)));
        }
        Ok(response)
    }

    async fn run(&self, response: Response, core: &TransportCore, cancel: &CancellationToken) -> ConnectionEnd {
        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return ConnectionEnd::Shutdown,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in decoder.push(&bytes) {
                            match ServerEvent::from_json(&frame.data) {
                                Ok(event) if event.is_heartbeat() => {}
                                Ok(event) => core.emit(TransportEvent::Message(event)),
                                Err(e) => tracing::warn!(error = %e, "Dropping undecodable server event"),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        core.emit(TransportEvent::Error(TransportError::Protocol(e.to_string())));
                        return ConnectionEnd::Lost { code: None, reason: e.to_string() };
                    }
                    None => {
                        return ConnectionEnd::Lost { code: None, reason: "event stream ended".into() };
                    }
                },
            }
        }
    }
}
