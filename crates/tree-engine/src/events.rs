//! Event types for observing tree operations
//!
//! Events are sent from the engine to any consumer (devtools, logs, tests)
//! to report operation lifecycles, pipeline events, reconciliation and
//! disposal. They are observational only; listeners that can veto work are
//! in [`crate::listeners`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::listeners::ListenerScope;
use crate::types::{Action, Completion, NodeId, OperationId};

/// Receives every [`TreeEvent`] a tree emits
///
/// Called outside the registry lock, in emission order per request.
pub trait EventSink: Send + Sync {
    fn send(&self, event: TreeEvent) -> Result<(), EventError>;
}

/// Why an event did not reach its consumer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("event consumer is gone")]
    Closed,

    #[error("event rejected: {0}")]
    Rejected(String),
}

/// Events emitted by a tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TreeEvent {
    /// A session took the node's active slot
    #[serde(rename_all = "camelCase")]
    OperationStarted {
        tree_id: String,
        node_id: NodeId,
        operation_id: OperationId,
        action: Action,
    },

    /// A session was marked canceled (superseded, vetoed, failed or disposed)
    #[serde(rename_all = "camelCase")]
    OperationCanceled {
        tree_id: String,
        node_id: NodeId,
        operation_id: OperationId,
    },

    /// A session left the node's active slot
    #[serde(rename_all = "camelCase")]
    OperationFinished {
        tree_id: String,
        node_id: NodeId,
        operation_id: OperationId,
        action: Action,
        completion: Completion,
    },

    /// A pipeline event step reached its listeners
    #[serde(rename_all = "camelCase")]
    NodeEvent {
        tree_id: String,
        node_id: NodeId,
        operation_id: OperationId,
        event: String,
        scope: ListenerScope,
    },

    /// The child registry was resynchronized with its source collection
    #[serde(rename_all = "camelCase")]
    ChildrenReconciled {
        tree_id: String,
        node_id: NodeId,
        added: usize,
        relocated: usize,
        removed: usize,
    },

    /// A node was torn down
    #[serde(rename_all = "camelCase")]
    NodeDisposed { tree_id: String, node_id: NodeId },
}

impl TreeEvent {
    /// Node the event concerns
    pub fn node_id(&self) -> NodeId {
        match self {
            Self::OperationStarted { node_id, .. }
            | Self::OperationCanceled { node_id, .. }
            | Self::OperationFinished { node_id, .. }
            | Self::NodeEvent { node_id, .. }
            | Self::ChildrenReconciled { node_id, .. }
            | Self::NodeDisposed { node_id, .. } => *node_id,
        }
    }
}

/// Discards every event
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: TreeEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Forwards events to an async consumer over an unbounded channel
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<TreeEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::UnboundedSender<TreeEvent>) -> Self {
        Self { sender }
    }

    /// A sink and the receiver its events arrive on
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TreeEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: TreeEvent) -> Result<(), EventError> {
        self.sender.send(event).map_err(|_| EventError::Closed)
    }
}

/// Keeps every event in memory
#[derive(Default)]
pub struct VecEventSink {
    events: Mutex<Vec<TreeEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TreeEvent> {
        self.events.lock().clone()
    }

    /// Events concerning one node, in emission order
    pub fn events_for(&self, node_id: NodeId) -> Vec<TreeEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.node_id() == node_id)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: TreeEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_event_sink() {
        let sink = VecEventSink::new();

        sink.send(TreeEvent::NodeDisposed {
            tree_id: "tree-1".to_string(),
            node_id: NodeId(4),
        })
        .unwrap();
        sink.send(TreeEvent::NodeDisposed {
            tree_id: "tree-1".to_string(),
            node_id: NodeId(5),
        })
        .unwrap();

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.events_for(NodeId(5)).len(), 1);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_null_event_sink() {
        let sink = NullEventSink;
        sink.send(TreeEvent::NodeDisposed {
            tree_id: "tree-1".to_string(),
            node_id: NodeId(1),
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_until_closed() {
        let (sink, mut receiver) = ChannelEventSink::channel();
        let disposed = TreeEvent::NodeDisposed {
            tree_id: "tree-1".to_string(),
            node_id: NodeId(3),
        };

        sink.send(disposed.clone()).unwrap();
        assert_eq!(receiver.recv().await, Some(disposed.clone()));

        drop(receiver);
        assert_eq!(sink.send(disposed), Err(EventError::Closed));
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = TreeEvent::OperationFinished {
            tree_id: "tree-1".to_string(),
            node_id: NodeId(2),
            operation_id: OperationId(7),
            action: Action::Expand,
            completion: Completion::Succeeded,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "operationFinished");
        assert_eq!(json["nodeId"], 2);
        assert_eq!(json["operationId"], 7);
        assert_eq!(json["action"], "expand");
        assert_eq!(json["completion"]["status"], "succeeded");
    }
}
