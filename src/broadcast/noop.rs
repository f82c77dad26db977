use super::{BackendKind, BroadcastMessage, ChannelBackend};
use crate::shared::error::BroadcastError;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Backend for platforms with no shared channel: posts go nowhere and
/// nothing is ever received. Single-replica operation is unaffected.
#[derive(Debug)]
pub struct NoopChannel {
    // Kept so subscribers wait forever instead of seeing a closed channel
    sender: broadcast::Sender<BroadcastMessage>,
}

impl NoopChannel {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(1).0,
        }
    }
}

impl Default for NoopChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelBackend for NoopChannel {
    fn kind(&self) -> BackendKind {
        BackendKind::Noop
    }

    async fn post(&self, _message: &BroadcastMessage) -> Result<(), BroadcastError> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }

    async fn close(&self) {}
}
