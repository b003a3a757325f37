//! Tree Engine
//!
//! Per-node operation scheduling and child-list reconciliation for
//! hierarchical tree components.
//!
//! Every node of a [`Tree`] is an independently schedulable actor. Requests
//! (`build`, `expand`, `collapse`, `toggle`, `dispose`) may arrive while an
//! earlier request against the same node is still running; the engine
//! decides per request whether to start it, cancel the running operation in
//! its favor, queue it, or skip it as redundant. It guarantees:
//!
//! - **At most one active operation per node**
//! - **FIFO callbacks**: callbacks for requests against one node fire in the
//!   order the requests were issued, whatever happened to the underlying work
//! - **Cooperative cancellation** with rollback to the last at-rest state
//! - **Identity-preserving reconciliation** of a node's children against its
//!   source collection
//!
//! Rendering and the source data model are external collaborators expressed
//! as the [`NodeRenderer`] and [`SourceModel`] traits.
//!
//! # Example
//!
//! ```no_run
//! use tree_engine::{OperationArgs, SourceRef, Tree};
//!
//! # async fn example() -> tree_engine::Result<()> {
//! let tree = Tree::new(SourceRef::new("root"))?;
//! let root = tree.root();
//!
//! tree.expand(root, OperationArgs::new(), |completion| {
//!     println!("expanded: {}", completion.is_success());
//! })?;
//!
//! let completion = tree.collapse_async(root, OperationArgs::new()).await?;
//! assert!(completion.is_success());
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod listeners;
pub mod pipeline;
pub mod reconcile;
pub mod renderer;
pub mod resolver;
pub mod testing;
pub mod tree;
pub mod types;

mod adapter;
mod node;
mod registry;
mod scheduler;
mod session;

pub use callbacks::{CallbackStack, DrainedCallbacks, OperationCallback};
pub use config::{ConfigError, ExpandMode, NodeOptions, SharingPolicy, TreeConfig};
pub use error::{Result, TreeError};
pub use events::{
    ChannelEventSink, EventError, EventSink, NullEventSink, TreeEvent, VecEventSink,
};
pub use listeners::{EventArgs, ListenerScope, NodeListener};
pub use pipeline::{CancelHandle, PipelineReport, Step, StepArgs, StepKind, StepPipeline};
pub use reconcile::{
    diff, ChangeKind, ChangeObserver, ChangeRecord, IdentityObserver, ReconcileOutcome,
};
pub use renderer::{LeafModel, NodeRenderer, NullRenderer, SourceModel};
pub use resolver::{resolve, resolve_toggle, Decision};
pub use tree::{Tree, TreeBuilder};
pub use types::{
    Action, Completion, NodeId, NodeState, OperationArgs, OperationId, Request, SourceRef,
};
