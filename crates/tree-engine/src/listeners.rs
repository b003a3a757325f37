//! Node-scope and tree-scope event listeners
//!
//! Each pipeline event is delivered to two ordered listener scopes: first the
//! listeners registered on the node, then those registered on the tree.
//! Cancellation and stop-propagation travel explicitly in [`EventArgs`]
//! rather than through captured state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::pipeline::StepArgs;
use crate::types::{Action, NodeId, OperationId};

/// Which listener list an event step targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerScope {
    Node,
    Tree,
}

/// Arguments handed to listeners for one event step
#[derive(Debug, Clone)]
pub struct EventArgs {
    pub node: NodeId,
    pub operation: OperationId,
    pub action: Action,
    /// Event name, e.g. `expanding`
    pub event: String,
    pub scope: ListenerScope,
    /// Only pre-events (`building`, `expanding`, `collapsing`) honor `cancel`
    pub cancelable: bool,
    pub cancel: bool,
    /// Set by a node-scope listener to keep the tree-scope listeners from running
    pub stop_propagation: bool,
    pub context: serde_json::Value,
}

impl EventArgs {
    /// Translate pipeline-native step arguments into listener arguments
    pub(crate) fn inject(
        step: &mut StepArgs,
        node: NodeId,
        operation: OperationId,
        action: Action,
        scope: ListenerScope,
        cancelable: bool,
    ) -> Self {
        Self {
            node,
            operation,
            action,
            event: step.name.clone(),
            scope,
            cancelable,
            cancel: false,
            stop_propagation: false,
            context: std::mem::take(&mut step.data),
        }
    }

    /// Hand the listener results back to the pipeline
    pub(crate) fn write_back(self, step: &mut StepArgs) {
        step.cancel |= self.cancelable && self.cancel;
        step.stop_propagation |= self.scope == ListenerScope::Node && self.stop_propagation;
        step.data = self.context;
    }
}

/// Receives pipeline events for a node or a whole tree
pub trait NodeListener: Send + Sync {
    fn on_event(&self, args: &mut EventArgs);
}

impl<F> NodeListener for F
where
    F: Fn(&mut EventArgs) + Send + Sync,
{
    fn on_event(&self, args: &mut EventArgs) {
        self(args)
    }
}

/// Run listeners in registration order
pub(crate) fn notify_all(listeners: &[Arc<dyn NodeListener>], args: &mut EventArgs) {
    for listener in listeners {
        listener.on_event(args);
    }
}
