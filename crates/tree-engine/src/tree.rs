//! Public tree handle
//!
//! [`Tree`] is a cheaply cloneable handle over one node registry. Requests
//! are resolved synchronously and return immediately; the resulting
//! pipelines run as tasks on the tokio runtime captured when the tree was
//! built. Every request takes an optional completion callback and also has
//! an awaitable `*_async` form.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::adapter;
use crate::callbacks::{DrainedCallbacks, OperationCallback};
use crate::config::{ExpandMode, NodeOptions, TreeConfig};
use crate::error::{Result, TreeError};
use crate::events::{EventSink, NullEventSink, TreeEvent};
use crate::listeners::{notify_all, EventArgs, ListenerScope, NodeListener};
use crate::pipeline::StepArgs;
use crate::reconcile::{reconcile, ChangeObserver, IdentityObserver, ReconcileOutcome};
use crate::registry::Registry;
use crate::renderer::{LeafModel, NodeRenderer, NullRenderer, SourceModel};
use crate::resolver::Decision;
use crate::scheduler::{Effects, Scheduler};
use crate::types::{
    Action, Completion, NodeId, NodeState, OperationArgs, OperationId, Request, SourceRef,
};

/// Handle to a tree of nodes
#[derive(Clone)]
pub struct Tree {
    inner: Arc<TreeInner>,
}

struct TreeInner {
    id: String,
    registry: Mutex<Registry>,
    config: TreeConfig,
    renderer: Arc<dyn NodeRenderer>,
    model: Arc<dyn SourceModel>,
    observer: Arc<dyn ChangeObserver>,
    events: Arc<dyn EventSink>,
    listeners: RwLock<Vec<Arc<dyn NodeListener>>>,
    delivery: Mutex<Delivery>,
    runtime: Handle,
}

/// Completions waiting to be fired, in the order they were drained
#[derive(Default)]
struct Delivery {
    queue: VecDeque<(DrainedCallbacks, Completion)>,
    running: bool,
}

/// Children a build settled, and how to build them
pub(crate) struct ChildPlan {
    pub outcome: ReconcileOutcome,
    pub child_recursive: bool,
}

/// Builder for [`Tree`]
pub struct TreeBuilder {
    root: SourceRef,
    config: TreeConfig,
    renderer: Arc<dyn NodeRenderer>,
    model: Arc<dyn SourceModel>,
    observer: Arc<dyn ChangeObserver>,
    events: Arc<dyn EventSink>,
}

impl TreeBuilder {
    pub fn config(mut self, config: TreeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn NodeRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn model(mut self, model: Arc<dyn SourceModel>) -> Self {
        self.model = model;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ChangeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Must be called from within a tokio runtime
    pub fn build(self) -> Result<Tree> {
        let runtime = Handle::try_current().map_err(|_| TreeError::NoRuntime)?;
        let id = format!("tree-{}", Uuid::new_v4());
        log::debug!("creating {}", id);

        Ok(Tree {
            inner: Arc::new(TreeInner {
                id,
                registry: Mutex::new(Registry::new(self.root, &self.config)),
                config: self.config,
                renderer: self.renderer,
                model: self.model,
                observer: self.observer,
                events: self.events,
                listeners: RwLock::new(Vec::new()),
                delivery: Mutex::new(Delivery::default()),
                runtime,
            }),
        })
    }
}

impl Tree {
    pub fn builder(root: SourceRef) -> TreeBuilder {
        TreeBuilder {
            root,
            config: TreeConfig::default(),
            renderer: Arc::new(NullRenderer),
            model: Arc::new(LeafModel),
            observer: Arc::new(IdentityObserver),
            events: Arc::new(NullEventSink),
        }
    }

    /// Tree with default configuration and no-op collaborators
    pub fn new(root: SourceRef) -> Result<Self> {
        Self::builder(root).build()
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Submit a request, returning how it was scheduled
    pub fn request(
        &self,
        node: NodeId,
        request: Request,
        args: OperationArgs,
        callback: Option<OperationCallback>,
    ) -> Result<Decision> {
        args.validate()?;
        self.transact(|registry, effects| {
            Scheduler::new(registry, effects).schedule(node, request, args, callback)
        })
    }

    pub fn build<F>(&self, node: NodeId, args: OperationArgs, callback: F) -> Result<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.request(node, Request::Build, args, Some(Box::new(callback)))
            .map(|_| ())
    }

    pub fn expand<F>(&self, node: NodeId, args: OperationArgs, callback: F) -> Result<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.request(node, Request::Expand, args, Some(Box::new(callback)))
            .map(|_| ())
    }

    pub fn collapse<F>(&self, node: NodeId, args: OperationArgs, callback: F) -> Result<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.request(node, Request::Collapse, args, Some(Box::new(callback)))
            .map(|_| ())
    }

    pub fn toggle<F>(&self, node: NodeId, args: OperationArgs, callback: F) -> Result<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.request(node, Request::Toggle, args, Some(Box::new(callback)))
            .map(|_| ())
    }

    pub async fn build_async(&self, node: NodeId, args: OperationArgs) -> Result<Completion> {
        self.submit(node, Request::Build, args).await
    }

    pub async fn expand_async(&self, node: NodeId, args: OperationArgs) -> Result<Completion> {
        self.submit(node, Request::Expand, args).await
    }

    pub async fn collapse_async(&self, node: NodeId, args: OperationArgs) -> Result<Completion> {
        self.submit(node, Request::Collapse, args).await
    }

    pub async fn toggle_async(&self, node: NodeId, args: OperationArgs) -> Result<Completion> {
        self.submit(node, Request::Toggle, args).await
    }

    async fn submit(
        &self,
        node: NodeId,
        request: Request,
        args: OperationArgs,
    ) -> Result<Completion> {
        let receiver = self.request_awaitable(node, request, args)?;
        receiver.await.map_err(|_| TreeError::CallbackDropped)
    }

    pub(crate) fn request_awaitable(
        &self,
        node: NodeId,
        request: Request,
        args: OperationArgs,
    ) -> Result<oneshot::Receiver<Completion>> {
        let (sender, receiver) = oneshot::channel();
        let callback: OperationCallback = Box::new(move |completion| {
            let _ = sender.send(completion);
        });
        self.request(node, request, args, Some(callback))?;
        Ok(receiver)
    }

    /// Tear a node and its subtree down immediately
    ///
    /// Owed callbacks fire as canceled. Disposing twice is a no-op.
    pub fn dispose(&self, node: NodeId) -> Result<()> {
        self.transact(|registry, effects| Scheduler::new(registry, effects).dispose(node))
    }

    /// The node's source children changed; rebuild it recursively
    pub fn children_changed(&self, node: NodeId) -> Result<()> {
        self.request(
            node,
            Request::Build,
            OperationArgs::new().recursive(true),
            None,
        )
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Instance id, `tree-{uuid}`
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &TreeConfig {
        &self.inner.config
    }

    pub fn root(&self) -> NodeId {
        self.inner.registry.lock().root()
    }

    /// Number of live nodes, the root included
    pub fn len(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposed nodes report [`NodeState::Disposed`]
    pub fn state(&self, node: NodeId) -> Result<NodeState> {
        self.inner.registry.lock().state(node)
    }

    pub fn is_expanded(&self, node: NodeId) -> Result<bool> {
        Ok(self.inner.registry.lock().get(node)?.expanded)
    }

    pub fn children(&self, node: NodeId) -> Result<Vec<NodeId>> {
        Ok(self.inner.registry.lock().get(node)?.children.clone())
    }

    pub fn parent(&self, node: NodeId) -> Result<Option<NodeId>> {
        Ok(self.inner.registry.lock().get(node)?.parent)
    }

    pub fn source(&self, node: NodeId) -> Result<SourceRef> {
        Ok(self.inner.registry.lock().get(node)?.source.clone())
    }

    pub fn has_active_operation(&self, node: NodeId) -> Result<bool> {
        Ok(self.inner.registry.lock().get(node)?.active.is_some())
    }

    /// Operations still owed a callback on this node, ascending
    pub fn pending_operations(&self, node: NodeId) -> Result<Vec<OperationId>> {
        Ok(self.inner.registry.lock().get(node)?.pending_operations())
    }

    pub fn options(&self, node: NodeId) -> Result<Arc<NodeOptions>> {
        Ok(Arc::clone(&self.inner.registry.lock().get(node)?.options))
    }

    /// Replace the options of `node` across its sharing scope
    ///
    /// Returns how many nodes received the new value.
    pub fn update_options<F>(&self, node: NodeId, update: F) -> Result<usize>
    where
        F: FnOnce(&mut NodeOptions),
    {
        self.inner.registry.lock().update_options(node, update)
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    pub fn add_listener(&self, node: NodeId, listener: Arc<dyn NodeListener>) -> Result<()> {
        self.inner.registry.lock().get_mut(node)?.listeners.push(listener);
        Ok(())
    }

    pub fn remove_listeners(&self, node: NodeId) -> Result<()> {
        self.inner.registry.lock().get_mut(node)?.listeners.clear();
        Ok(())
    }

    /// Listen to every node; runs after the node's own listeners
    pub fn add_tree_listener(&self, listener: Arc<dyn NodeListener>) {
        self.inner.listeners.write().push(listener);
    }

    // ------------------------------------------------------------------
    // Pipeline hooks
    // ------------------------------------------------------------------

    pub(crate) fn renderer(&self) -> &Arc<dyn NodeRenderer> {
        &self.inner.renderer
    }

    pub(crate) fn begin(&self, node: NodeId, operation: OperationId) -> bool {
        self.transact(|registry, effects| Scheduler::new(registry, effects).begin(node, operation))
    }

    pub(crate) fn can_continue(&self, node: NodeId, operation: OperationId) -> bool {
        let mut registry = self.inner.registry.lock();
        let mut effects = Effects::new(&self.inner.id);
        Scheduler::new(&mut registry, &mut effects).can_continue(node, operation)
    }

    pub(crate) fn fail(&self, node: NodeId, operation: OperationId, message: String) {
        self.transact(|registry, effects| {
            Scheduler::new(registry, effects).fail(node, operation, message)
        });
    }

    pub(crate) fn complete(&self, node: NodeId, operation: OperationId) {
        let result = self.transact(|registry, effects| {
            Scheduler::new(registry, effects).complete(node, operation)
        });
        if let Err(err) = result {
            log::warn!("{} could not complete on {}: {}", operation, node, err);
        }
    }

    /// Deliver one event step to a listener scope
    pub(crate) fn dispatch_event(
        &self,
        node: NodeId,
        operation: OperationId,
        action: Action,
        scope: ListenerScope,
        cancelable: bool,
        step: &mut StepArgs,
    ) {
        let listeners = match scope {
            ListenerScope::Node => self
                .inner
                .registry
                .lock()
                .get(node)
                .map(|entry| entry.listeners.clone())
                .unwrap_or_default(),
            ListenerScope::Tree => self.inner.listeners.read().clone(),
        };

        let mut args = EventArgs::inject(step, node, operation, action, scope, cancelable);
        let event = args.event.clone();
        notify_all(&listeners, &mut args);
        let vetoed = args.cancelable && args.cancel;
        args.write_back(step);

        self.emit(TreeEvent::NodeEvent {
            tree_id: self.inner.id.clone(),
            node_id: node,
            operation_id: operation,
            event,
            scope,
        });

        if vetoed {
            self.transact(|registry, effects| {
                Scheduler::new(registry, effects).cancel(node, operation)
            });
        }
    }

    /// Reconcile `node`'s children when the running action calls for it
    pub(crate) fn reconcile_children(
        &self,
        node: NodeId,
        action: Action,
        recursive: Option<bool>,
    ) -> Result<Option<ChildPlan>> {
        let (source, options, hidden_root, parent_state) = {
            let registry = self.inner.registry.lock();
            let entry = registry.get(node)?;
            let parent_state = match entry.parent {
                Some(parent) => Some(registry.state(parent)?),
                None => None,
            };
            (
                entry.source.clone(),
                Arc::clone(&entry.options),
                entry.is_root() && !self.inner.config.show_root,
                parent_state,
            )
        };

        let recursive = recursive.unwrap_or(options.recursive_default);
        let eager = !options.lazy && parent_state == Some(NodeState::Expanding);
        if !(recursive || action == Action::Expand || hidden_root || eager) {
            return Ok(None);
        }

        let current = self.inner.model.children(&source);
        let observer = Arc::clone(&self.inner.observer);
        let outcome = self.transact(|registry, effects| {
            reconcile(registry, effects, node, current, observer.as_ref())
        })?;

        let descendants = action == Action::Expand
            && options.expand_mode == ExpandMode::Descendants;
        Ok(Some(ChildPlan {
            outcome,
            child_recursive: recursive || descendants,
        }))
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    /// Run `f` under the registry lock, then apply what it collected
    fn transact<R>(&self, f: impl FnOnce(&mut Registry, &mut Effects) -> R) -> R {
        let mut effects = Effects::new(&self.inner.id);
        let result = {
            let mut registry = self.inner.registry.lock();
            let result = f(&mut registry, &mut effects);
            if !effects.completions.is_empty() {
                // Queued while still locked so drain order is delivery order
                self.inner
                    .delivery
                    .lock()
                    .queue
                    .extend(effects.completions.drain(..));
            }
            result
        };
        self.apply(effects);
        result
    }

    fn apply(&self, effects: Effects) {
        for handle in &effects.cancels {
            handle.cancel();
        }
        for node in &effects.detached {
            self.inner.renderer.detach(*node);
        }
        for event in effects.events {
            self.emit(event);
        }
        for launch in effects.launches {
            self.inner
                .runtime
                .spawn(adapter::run_session(self.clone(), launch));
        }
        self.deliver();
    }

    /// Fire queued callbacks one after another
    ///
    /// Re-entrant requests made from a callback queue their completions
    /// behind the one being delivered instead of firing them inline.
    fn deliver(&self) {
        {
            let mut delivery = self.inner.delivery.lock();
            if delivery.running || delivery.queue.is_empty() {
                return;
            }
            delivery.running = true;
        }
        loop {
            let next = {
                let mut delivery = self.inner.delivery.lock();
                let next = delivery.queue.pop_front();
                if next.is_none() {
                    delivery.running = false;
                }
                next
            };
            let Some((callbacks, completion)) = next else {
                break;
            };
            let fired = panic::catch_unwind(AssertUnwindSafe(|| {
                callbacks.fire_sequentially(&completion)
            }));
            if fired.is_err() {
                log::error!("{}: operation callback panicked", self.inner.id);
            }
        }
    }

    fn emit(&self, event: TreeEvent) {
        if let Err(err) = self.inner.events.send(event) {
            log::warn!("{}: dropped event: {}", self.inner.id, err);
        }
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.inner.id)
            .field("nodes", &self.len())
            .finish()
    }
}
