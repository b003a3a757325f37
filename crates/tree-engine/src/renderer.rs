//! Render and source-model collaborators
//!
//! The engine never materializes anything itself. It asks a [`NodeRenderer`]
//! to (re)bind a node's content, lay out its child container, and show or
//! hide its children, and it asks a [`SourceModel`] for a source object's
//! children.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{NodeId, SourceRef};

/// Materializes nodes on behalf of the engine
///
/// Async methods are awaited from pipeline jobs; an `Err` fails the running
/// operation. `detach` is called synchronously during disposal.
#[async_trait]
pub trait NodeRenderer: Send + Sync {
    /// Bind the node's own content to its source
    async fn render_content(&self, node: NodeId, source: &SourceRef) -> Result<()>;

    /// Lay out the child container with the settled child order
    async fn render_children(&self, node: NodeId, children: &[NodeId]) -> Result<()>;

    /// Show or hide the node's children
    async fn set_expanded(&self, node: NodeId, expanded: bool) -> Result<()>;

    /// Release everything held for a disposed node
    fn detach(&self, node: NodeId);
}

/// Renderer that accepts everything and does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

#[async_trait]
impl NodeRenderer for NullRenderer {
    async fn render_content(&self, _node: NodeId, _source: &SourceRef) -> Result<()> {
        Ok(())
    }

    async fn render_children(&self, _node: NodeId, _children: &[NodeId]) -> Result<()> {
        Ok(())
    }

    async fn set_expanded(&self, _node: NodeId, _expanded: bool) -> Result<()> {
        Ok(())
    }

    fn detach(&self, _node: NodeId) {}
}

/// Source of child collections
pub trait SourceModel: Send + Sync {
    /// Current children of `source`, in display order
    fn children(&self, source: &SourceRef) -> Vec<SourceRef>;
}

impl<F> SourceModel for F
where
    F: Fn(&SourceRef) -> Vec<SourceRef> + Send + Sync,
{
    fn children(&self, source: &SourceRef) -> Vec<SourceRef> {
        self(source)
    }
}

/// Model in which no source has children
#[derive(Debug, Default, Clone, Copy)]
pub struct LeafModel;

impl SourceModel for LeafModel {
    fn children(&self, _source: &SourceRef) -> Vec<SourceRef> {
        Vec::new()
    }
}
