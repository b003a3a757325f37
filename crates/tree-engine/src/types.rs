//! Core types for tree nodes and their operations
//!
//! These types describe node identity, the node state machine, the actions
//! that can be requested against a node, and how an operation completed.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeError};

/// Tree-unique node identifier
///
/// Assigned from a per-tree monotonic counter and never reused, so an id
/// below the counter that is no longer registered always denotes a
/// disposed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// Raw counter value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Strictly increasing per-tree operation identifier
///
/// Doubles as the FIFO tie-break when a merged callback stack is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub(crate) u64);

impl OperationId {
    /// Raw counter value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Node state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Never operated on
    None,
    /// Content rebinding in progress
    Building,
    /// At rest, children hidden
    Collapsed,
    /// Hiding children
    Collapsing,
    /// At rest, children visible
    Expanded,
    /// Showing children
    Expanding,
    /// Terminal; accepts no further actions
    Disposed,
}

impl NodeState {
    /// Every state, in declaration order
    pub const ALL: [NodeState; 7] = [
        NodeState::None,
        NodeState::Building,
        NodeState::Collapsed,
        NodeState::Collapsing,
        NodeState::Expanded,
        NodeState::Expanding,
        NodeState::Disposed,
    ];

    /// Whether no operation is transitioning this state
    pub fn is_at_rest(self) -> bool {
        matches!(self, Self::None | Self::Collapsed | Self::Expanded)
    }
}

/// An action a session can run
///
/// Toggle and Dispose never become sessions: toggle resolves to one of these
/// before scheduling and dispose tears the node down immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Build,
    Expand,
    Collapse,
}

impl Action {
    /// Every action, in declaration order
    pub const ALL: [Action; 3] = [Action::Build, Action::Expand, Action::Collapse];

    /// State held while this action runs
    pub fn in_progress_state(self) -> NodeState {
        match self {
            Self::Build => NodeState::Building,
            Self::Expand => NodeState::Expanding,
            Self::Collapse => NodeState::Collapsing,
        }
    }

    /// State reached when this action completes
    ///
    /// A build keeps whatever visibility the node already had.
    pub fn completed_state(self, expanded: bool) -> NodeState {
        match self {
            Self::Build if expanded => NodeState::Expanded,
            Self::Build => NodeState::Collapsed,
            Self::Expand => NodeState::Expanded,
            Self::Collapse => NodeState::Collapsed,
        }
    }

    /// The visibility transition opposing this one, if any
    pub fn opposite(self) -> Option<Action> {
        match self {
            Self::Build => None,
            Self::Expand => Some(Self::Collapse),
            Self::Collapse => Some(Self::Expand),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Expand => "expand",
            Self::Collapse => "collapse",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A caller request before toggle resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Build,
    Expand,
    Collapse,
    Toggle,
}

/// How an operation ended, as reported to its callback
///
/// Every callback in a merged stack receives the completion of the session
/// that drained the stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Completion {
    /// The work ran to completion (or was redundant)
    Succeeded,
    /// Superseded, vetoed by a listener, or the node was disposed
    Canceled,
    /// A pipeline step failed
    Failed { error: String },
}

impl Completion {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Optional arguments accompanying a request
#[derive(Debug, Clone, Default)]
pub struct OperationArgs {
    /// Rebuild descendants; falls back to the node's `recursive_default`
    pub recursive: Option<bool>,
    /// Caller-supplied carry-over value, threaded through every step
    pub context: serde_json::Value,
}

impl OperationArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = Some(recursive);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Reject contexts that are neither null nor a JSON object
    pub fn validate(&self) -> Result<()> {
        match self.context {
            serde_json::Value::Null | serde_json::Value::Object(_) => Ok(()),
            ref other => Err(TreeError::InvalidArgs(format!(
                "context must be an object or null, got {other}"
            ))),
        }
    }
}

/// Opaque handle to a source object backing a node
///
/// Compared by pointer identity, never by value: two sources holding equal
/// data are still different children.
#[derive(Clone)]
pub struct SourceRef(Arc<dyn Any + Send + Sync>);

impl SourceRef {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(value)
    }

    /// Identity comparison
    pub fn same(&self, other: &SourceRef) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }

    /// Address used to key identity lookups
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceRef({:#x})", self.identity())
    }
}
