use async_trait::async_trait;
use homestead_domain::{BroadcastEvent, BroadcastSink, DomainResult};
use tokio::sync::broadcast;
use tracing::trace;

/// Fan-out hub for live observers, backed by a tokio broadcast
/// channel. Publishing with no subscribers drops the event; slow
/// subscribers lag and skip rather than block ingestion.
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// New subscription receiving every event from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl BroadcastSink for ChannelBroadcaster {
    async fn broadcast(&self, event: BroadcastEvent) -> DomainResult<()> {
        if self.sender.send(event).is_err() {
            trace!("no live observers, event dropped");
        }
        Ok(())
    }
}
