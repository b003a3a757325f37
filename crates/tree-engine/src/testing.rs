//! Test doubles for driving trees deterministically
//!
//! [`GatedRenderer`] records every render call and can hold a node's jobs
//! until the test releases them, which makes "request arrives while the
//! previous operation is in flight" reproducible without timing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::error::{Result, TreeError};
use crate::listeners::{EventArgs, NodeListener};
use crate::renderer::{NodeRenderer, SourceModel};
use crate::types::{Completion, NodeId, SourceRef};

/// One call a [`GatedRenderer`] received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCall {
    Content(NodeId),
    Children(NodeId, Vec<NodeId>),
    Visibility(NodeId, bool),
    Detach(NodeId),
}

impl RenderCall {
    pub fn node(&self) -> NodeId {
        match self {
            Self::Content(node)
            | Self::Children(node, _)
            | Self::Visibility(node, _)
            | Self::Detach(node) => *node,
        }
    }
}

/// Renderer whose content and visibility jobs can be held per node
#[derive(Default)]
pub struct GatedRenderer {
    calls: Mutex<Vec<RenderCall>>,
    gates: Mutex<HashMap<NodeId, Arc<Semaphore>>>,
    failing: Mutex<HashSet<NodeId>>,
    changed: Notify,
}

impl GatedRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block content and visibility jobs of `node` until released
    pub fn hold(&self, node: NodeId) {
        self.gates
            .lock()
            .insert(node, Arc::new(Semaphore::new(0)));
    }

    /// Let one held job of `node` through
    pub fn release_one(&self, node: NodeId) {
        if let Some(gate) = self.gates.lock().get(&node) {
            gate.add_permits(1);
        }
    }

    /// Stop holding `node`, releasing every waiting job
    pub fn open(&self, node: NodeId) {
        if let Some(gate) = self.gates.lock().remove(&node) {
            gate.close();
        }
    }

    /// Make content renders of `node` fail
    pub fn fail_on(&self, node: NodeId) {
        self.failing.lock().insert(node);
    }

    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, node: NodeId) -> Vec<RenderCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.node() == node)
            .cloned()
            .collect()
    }

    pub fn content_count(&self, node: NodeId) -> usize {
        self.count(|call| *call == RenderCall::Content(node))
    }

    pub fn visibility_count(&self, node: NodeId) -> usize {
        self.count(|call| matches!(call, RenderCall::Visibility(n, _) if *n == node))
    }

    fn count(&self, predicate: impl Fn(&RenderCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Resolve once `predicate` holds for the recorded calls
    pub async fn wait_until(&self, predicate: impl Fn(&[RenderCall]) -> bool) {
        loop {
            let notified = self.changed.notified();
            if predicate(&self.calls.lock()) {
                return;
            }
            notified.await;
        }
    }

    /// Resolve once `node` has started `count` content renders
    pub async fn wait_for_content(&self, node: NodeId, count: usize) {
        self.wait_until(|calls| {
            calls
                .iter()
                .filter(|call| **call == RenderCall::Content(node))
                .count()
                >= count
        })
        .await
    }

    /// Resolve once `node` has started `count` visibility changes
    pub async fn wait_for_visibility(&self, node: NodeId, count: usize) {
        self.wait_until(|calls| {
            calls
                .iter()
                .filter(|call| matches!(call, RenderCall::Visibility(n, _) if *n == node))
                .count()
                >= count
        })
        .await
    }

    fn record(&self, call: RenderCall) {
        self.calls.lock().push(call);
        self.changed.notify_waiters();
    }

    async fn pass_gate(&self, node: NodeId) {
        let gate = self.gates.lock().get(&node).cloned();
        if let Some(gate) = gate {
            // A closed gate means the node was opened
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl NodeRenderer for GatedRenderer {
    async fn render_content(&self, node: NodeId, _source: &SourceRef) -> Result<()> {
        self.record(RenderCall::Content(node));
        self.pass_gate(node).await;
        if self.failing.lock().contains(&node) {
            return Err(TreeError::render(format!("content of {node} unavailable")));
        }
        Ok(())
    }

    async fn render_children(&self, node: NodeId, children: &[NodeId]) -> Result<()> {
        self.record(RenderCall::Children(node, children.to_vec()));
        Ok(())
    }

    async fn set_expanded(&self, node: NodeId, expanded: bool) -> Result<()> {
        self.record(RenderCall::Visibility(node, expanded));
        self.pass_gate(node).await;
        Ok(())
    }

    fn detach(&self, node: NodeId) {
        self.record(RenderCall::Detach(node));
    }
}

/// Listener recording event names, optionally vetoing or stopping propagation
#[derive(Default)]
pub struct RecordingListener {
    seen: Mutex<Vec<String>>,
    veto: Option<String>,
    stop_propagation: bool,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the operation when `event` arrives
    pub fn vetoing(event: &str) -> Self {
        Self {
            veto: Some(event.to_string()),
            ..Self::default()
        }
    }

    /// Keep tree-scope listeners from seeing any event
    pub fn stopping() -> Self {
        Self {
            stop_propagation: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

impl NodeListener for RecordingListener {
    fn on_event(&self, args: &mut EventArgs) {
        self.seen.lock().push(args.event.clone());
        if self.veto.as_deref() == Some(args.event.as_str()) {
            args.cancel = true;
        }
        if self.stop_propagation {
            args.stop_propagation = true;
        }
    }
}

/// Source model with children set per source
#[derive(Default)]
pub struct StaticModel {
    children: Mutex<HashMap<usize, Vec<SourceRef>>>,
}

impl StaticModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_children(&self, parent: &SourceRef, children: Vec<SourceRef>) {
        self.children.lock().insert(parent.identity(), children);
    }
}

impl SourceModel for StaticModel {
    fn children(&self, source: &SourceRef) -> Vec<SourceRef> {
        self.children
            .lock()
            .get(&source.identity())
            .cloned()
            .unwrap_or_default()
    }
}

/// Records labelled completions in firing order
#[derive(Clone, Default)]
pub struct CallbackLog {
    inner: Arc<CallbackLogInner>,
}

#[derive(Default)]
struct CallbackLogInner {
    entries: Mutex<Vec<(String, Completion)>>,
    changed: Notify,
}

impl CallbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self, label: impl Into<String>) -> impl FnOnce(Completion) + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let label = label.into();
        move |completion| {
            inner.entries.lock().push((label, completion));
            inner.changed.notify_waiters();
        }
    }

    pub fn entries(&self) -> Vec<(String, Completion)> {
        self.inner.entries.lock().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.inner
            .entries
            .lock()
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once `count` callbacks have fired
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.inner.changed.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }
}
