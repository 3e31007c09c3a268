//! Node lifecycle notifications for the rest of the agent (monitoring, KV, dashboards...).

use super::types::NodeId;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    NewNode(NodeId),
    ChangeNode(NodeId),
    DeleteNode(NodeId),
}

impl NodeEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            NodeEvent::NewNode(_) => "new-node",
            NodeEvent::ChangeNode(_) => "change-node",
            NodeEvent::DeleteNode(_) => "delete-node",
        }
    }
}

pub struct NodeEventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl NodeEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Fire and forget: having no subscriber is fine, and lagging subscribers lose old events.
    pub fn publish(&self, event: NodeEvent) {
        tracing::trace!("bus: {} {:?}", event.topic(), event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }
}

impl Default for NodeEventBus {
    fn default() -> Self {
        Self::new()
    }
}
