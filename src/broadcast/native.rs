use super::{BackendKind, BroadcastMessage, ChannelBackend};
use crate::shared::error::BroadcastError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const HUB_CHANNEL_CAPACITY: usize = 256;

/// Process-wide registry of named broadcast channels.
///
/// Every replica that opens the same name shares one
/// `tokio::sync::broadcast` channel.
#[derive(Debug, Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<BroadcastMessage>>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or join) the channel called `name`
    pub fn open(&self, name: &str) -> NativeChannel {
        let sender = self
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(HUB_CHANNEL_CAPACITY).0)
            .clone();
        NativeChannel {
            name: name.to_string(),
            sender,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of replicas listening on `name`
    pub fn listeners(&self, name: &str) -> usize {
        self.channels
            .lock()
            .get(name)
            .map_or(0, |sender| sender.receiver_count())
    }
}

/// One replica's handle on a hub channel
#[derive(Debug)]
pub struct NativeChannel {
    name: String,
    sender: broadcast::Sender<BroadcastMessage>,
    closed: AtomicBool,
}

#[async_trait]
impl ChannelBackend for NativeChannel {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn post(&self, message: &BroadcastMessage) -> Result<(), BroadcastError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BroadcastError::Closed);
        }
        match self.sender.send(message.clone()) {
            Ok(receivers) => {
                tracing::trace!(channel = %self.name, receivers, "Posted broadcast");
            }
            Err(_) => {
                // Nobody else is listening
                tracing::trace!(channel = %self.name, "Broadcast had no receivers");
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
