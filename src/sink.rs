use tokio::sync::mpsc;
use tracing::warn;

use crate::types::AgentEvent;

/// Outbound event channel. Never blocks; delivery is the transport's job.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

/// Sink backed by an unbounded queue drained by a transport task.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: AgentEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            warn!("Transport is gone, dropping {} event", name);
        }
    }
}
