//! Error types for the tree engine

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::NodeId;

/// Result type alias using TreeError
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors that can occur in the tree engine
#[derive(Debug, Error)]
pub enum TreeError {
    /// The id was never issued by this tree
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// The node existed but has been disposed
    #[error("Node disposed: {0}")]
    NodeDisposed(NodeId),

    /// Malformed operation arguments
    #[error("Invalid operation arguments: {0}")]
    InvalidArgs(String),

    /// Trees must be created inside a tokio runtime
    #[error("No tokio runtime available to drive node operations")]
    NoRuntime,

    /// The render collaborator reported a failure
    #[error("Render error: {0}")]
    Render(String),

    /// A pipeline step failed
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// A pipeline seek targeted a key that was never added
    #[error("Unknown pipeline step: {0}")]
    UnknownStep(String),

    /// A change observer produced records that do not describe the new collection
    #[error("Inconsistent change records for {node}: {reason}")]
    InconsistentChanges { node: NodeId, reason: String },

    /// The completion sender was dropped before the operation finished
    #[error("Operation dropped before completion")]
    CallbackDropped,

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TreeError {
    /// Create a render error with a message
    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// Create a step failure for the named step
    pub fn step_failed(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: msg.into(),
        }
    }
}
