//! Node arena
//!
//! Owns every live [`NodeEntry`] of a tree, the id counters, and the options
//! sharing policy applied when children are created.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{NodeOptions, SharingPolicy, TreeConfig};
use crate::error::{Result, TreeError};
use crate::node::NodeEntry;
use crate::types::{NodeId, NodeState, OperationId, SourceRef};

pub(crate) struct Registry {
    nodes: HashMap<NodeId, NodeEntry>,
    root: NodeId,
    next_node: u64,
    next_operation: u64,
    sharing: SharingPolicy,
}

impl Registry {
    pub fn new(root_source: SourceRef, config: &TreeConfig) -> Self {
        let root = NodeId(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            NodeEntry::new(root, None, root_source, Arc::new(config.options.clone())),
        );

        Self {
            nodes,
            root,
            next_node: 2,
            next_operation: 1,
            sharing: config.sharing,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Issued at some point, live or not
    pub fn was_issued(&self, id: NodeId) -> bool {
        id.0 >= 1 && id.0 < self.next_node
    }

    pub fn get(&self, id: NodeId) -> Result<&NodeEntry> {
        match self.nodes.get(&id) {
            Some(entry) => Ok(entry),
            None => Err(self.missing(id)),
        }
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry> {
        let missing = self.missing(id);
        self.nodes.get_mut(&id).ok_or(missing)
    }

    /// Disposed nodes report [`NodeState::Disposed`]; unknown ids are an error
    pub fn state(&self, id: NodeId) -> Result<NodeState> {
        match self.nodes.get(&id) {
            Some(entry) => Ok(entry.state),
            None if self.was_issued(id) => Ok(NodeState::Disposed),
            None => Err(TreeError::NodeNotFound(id)),
        }
    }

    fn missing(&self, id: NodeId) -> TreeError {
        if self.was_issued(id) {
            TreeError::NodeDisposed(id)
        } else {
            TreeError::NodeNotFound(id)
        }
    }

    pub fn next_operation_id(&mut self) -> OperationId {
        let id = OperationId(self.next_operation);
        self.next_operation += 1;
        id
    }

    /// Create an unlinked child entry; the caller places it in `children`
    ///
    /// `scope` comes from [`Registry::child_scope`] and is taken once per
    /// batch, so children created before any of them is linked still share
    /// options the way the policy says.
    pub fn create_child(
        &mut self,
        parent: NodeId,
        source: SourceRef,
        scope: &Arc<NodeOptions>,
    ) -> Result<NodeId> {
        self.get(parent)?;
        let options = match self.sharing {
            SharingPolicy::TreeShared | SharingPolicy::PeerShared => Arc::clone(scope),
            SharingPolicy::Cloned => Arc::new(scope.as_ref().clone()),
        };
        let id = NodeId(self.next_node);
        self.next_node += 1;

        self.nodes
            .insert(id, NodeEntry::new(id, Some(parent), source, options));
        Ok(id)
    }

    /// Options new children of `parent` start from
    pub fn child_scope(&self, parent: NodeId) -> Result<Arc<NodeOptions>> {
        let entry = self.get(parent)?;
        let options = match self.sharing {
            SharingPolicy::TreeShared | SharingPolicy::Cloned => Arc::clone(&entry.options),
            SharingPolicy::PeerShared => entry
                .children
                .iter()
                .filter_map(|child| self.nodes.get(child))
                .map(|sibling| Arc::clone(&sibling.options))
                .next()
                .unwrap_or_else(|| Arc::new(entry.options.as_ref().clone())),
        };
        Ok(options)
    }

    /// Remove an entry from the arena
    pub fn remove(&mut self, id: NodeId) -> Option<NodeEntry> {
        self.nodes.remove(&id)
    }

    /// Replace the options of `id` and every node sharing them
    pub fn update_options<F>(&mut self, id: NodeId, update: F) -> Result<usize>
    where
        F: FnOnce(&mut NodeOptions),
    {
        let current = Arc::clone(&self.get(id)?.options);
        let mut options = current.as_ref().clone();
        update(&mut options);
        let replacement = Arc::new(options);

        let mut replaced = 0;
        for entry in self.nodes.values_mut() {
            if Arc::ptr_eq(&entry.options, &current) {
                entry.options = Arc::clone(&replacement);
                replaced += 1;
            }
        }
        Ok(replaced)
    }
}
