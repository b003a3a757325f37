//! Per-node registry entries

use std::sync::Arc;

use crate::config::NodeOptions;
use crate::listeners::NodeListener;
use crate::session::OperationSession;
use crate::types::{NodeId, NodeState, OperationId, SourceRef};

pub(crate) struct NodeEntry {
    pub id: NodeId,
    pub state: NodeState,
    /// Rest state before the current or most recent operation started
    pub previous_completed: NodeState,
    pub active: Option<OperationSession>,
    /// Cached: the child list is visible
    pub expanded: bool,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub source: SourceRef,
    /// Sources backing `children`, index for index
    pub source_children: Vec<SourceRef>,
    pub options: Arc<NodeOptions>,
    pub listeners: Vec<Arc<dyn NodeListener>>,
}

impl NodeEntry {
    pub fn new(
        id: NodeId,
        parent: Option<NodeId>,
        source: SourceRef,
        options: Arc<NodeOptions>,
    ) -> Self {
        Self {
            id,
            state: NodeState::None,
            previous_completed: NodeState::None,
            active: None,
            expanded: false,
            parent,
            children: Vec::new(),
            source,
            source_children: Vec::new(),
            options,
            listeners: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether `operation` currently owns the active slot
    pub fn owns(&self, operation: OperationId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|session| session.id == operation)
    }

    /// Every operation id still owed a callback on this node
    pub fn pending_operations(&self) -> Vec<OperationId> {
        let mut pending = Vec::new();
        let mut next = self.active.as_ref();
        while let Some(session) = next {
            pending.extend(session.callbacks.operation_ids());
            next = session.continuation.as_deref();
        }
        pending.sort();
        pending
    }
}

impl std::fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEntry")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("previous_completed", &self.previous_completed)
            .field("active", &self.active.as_ref().map(|session| session.id))
            .field("expanded", &self.expanded)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}
