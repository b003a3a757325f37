//! Scheduler and cancellation engine
//!
//! Every decision here is synchronous and runs while the registry lock is
//! held. Anything that reaches outside the registry (spawning a pipeline,
//! signalling a cancel, detaching render resources, emitting events, firing
//! callbacks) is recorded in [`Effects`] and applied by the tree once the
//! lock is released, so callbacks are free to issue new requests.

use crate::callbacks::{CallbackStack, DrainedCallbacks, OperationCallback};
use crate::error::Result;
use crate::events::TreeEvent;
use crate::pipeline::CancelHandle;
use crate::registry::Registry;
use crate::resolver::{resolve, resolve_toggle, Decision};
use crate::session::OperationSession;
use crate::types::{
    Action, Completion, NodeId, NodeState, OperationArgs, OperationId, Request,
};

/// A session whose pipeline must be spawned
#[derive(Debug)]
pub(crate) struct Launch {
    pub node: NodeId,
    pub operation: OperationId,
    pub action: Action,
    pub args: OperationArgs,
    pub handle: CancelHandle,
}

/// Side effects collected under the registry lock
pub(crate) struct Effects {
    tree_id: String,
    pub launches: Vec<Launch>,
    pub cancels: Vec<CancelHandle>,
    pub detached: Vec<NodeId>,
    pub completions: Vec<(DrainedCallbacks, Completion)>,
    pub events: Vec<TreeEvent>,
}

impl Effects {
    pub fn new(tree_id: &str) -> Self {
        Self {
            tree_id: tree_id.to_string(),
            launches: Vec::new(),
            cancels: Vec::new(),
            detached: Vec::new(),
            completions: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn tree_id(&self) -> &str {
        &self.tree_id
    }

    pub fn emit(&mut self, event: TreeEvent) {
        self.events.push(event);
    }

    fn complete_now(
        &mut self,
        callback: Option<OperationCallback>,
        operation: OperationId,
        completion: Completion,
    ) {
        if let Some(callback) = callback {
            let mut stack = CallbackStack::new();
            stack.append(operation, callback);
            self.completions.push((stack.drain(), completion));
        }
    }

    fn started(&mut self, node: NodeId, operation: OperationId, action: Action) {
        let tree_id = self.tree_id.clone();
        self.emit(TreeEvent::OperationStarted {
            tree_id,
            node_id: node,
            operation_id: operation,
            action,
        });
    }

    fn finished(
        &mut self,
        node: NodeId,
        operation: OperationId,
        action: Action,
        completion: Completion,
    ) {
        let tree_id = self.tree_id.clone();
        self.emit(TreeEvent::OperationFinished {
            tree_id,
            node_id: node,
            operation_id: operation,
            action,
            completion,
        });
    }

    fn canceled(&mut self, node: NodeId, operation: OperationId) {
        let tree_id = self.tree_id.clone();
        self.emit(TreeEvent::OperationCanceled {
            tree_id,
            node_id: node,
            operation_id: operation,
        });
    }
}

/// Applies resolver decisions against the registry
pub(crate) struct Scheduler<'a> {
    registry: &'a mut Registry,
    effects: &'a mut Effects,
}

impl<'a> Scheduler<'a> {
    pub fn new(registry: &'a mut Registry, effects: &'a mut Effects) -> Self {
        Self { registry, effects }
    }

    /// Resolve and execute one request
    pub fn schedule(
        &mut self,
        node: NodeId,
        request: Request,
        args: OperationArgs,
        callback: Option<OperationCallback>,
    ) -> Result<Decision> {
        let state = self.registry.state(node)?;
        let operation = self.registry.next_operation_id();

        if state == NodeState::Disposed {
            log::debug!("{} rejected: {} is disposed", operation, node);
            self.effects
                .complete_now(callback, operation, Completion::Canceled);
            return Ok(Decision::Reject);
        }

        let entry = self.registry.get(node)?;
        let action = match request {
            Request::Build => Action::Build,
            Request::Expand => Action::Expand,
            Request::Collapse => Action::Collapse,
            Request::Toggle => resolve_toggle(
                entry.active.as_ref().and_then(OperationSession::effective_action),
                entry.expanded,
            ),
        };
        let draining = entry.active.is_some();

        let decision = resolve(state, action);
        log::debug!(
            "{} {} on {} ({:?}): {:?}",
            operation,
            action,
            node,
            state,
            decision
        );

        let session = OperationSession::new(operation, action, args, callback);
        match decision {
            Decision::Start if draining => self.queue_after(node, session)?,
            Decision::Start => self.start(node, session)?,
            Decision::CancelAndStart => self.cancel_and_start(node, session)?,
            Decision::QueueAfter => self.queue_after(node, session)?,
            Decision::Skip => self.skip(node, session)?,
            Decision::Reject => {}
        }
        Ok(decision)
    }

    fn start(&mut self, node: NodeId, session: OperationSession) -> Result<()> {
        let entry = self.registry.get_mut(node)?;
        entry.previous_completed = entry.state;
        entry.state = session.action.in_progress_state();

        self.effects.launches.push(Launch {
            node,
            operation: session.id,
            action: session.action,
            args: session.args.clone(),
            handle: session.handle.clone(),
        });
        self.effects.started(node, session.id, session.action);
        entry.active = Some(session);
        Ok(())
    }

    fn cancel_and_start(&mut self, node: NodeId, mut session: OperationSession) -> Result<()> {
        let entry = self.registry.get_mut(node)?;
        let Some(mut active) = entry.active.take() else {
            return self.start(node, session);
        };

        let already_canceled = active.canceled;
        active.cancel();
        active.callbacks.merge_into(&mut session.callbacks);
        active.drain_chain_into(&mut session.callbacks);
        entry.state = entry.previous_completed;
        if !already_canceled {
            self.effects.cancels.push(active.handle.clone());
            self.effects.canceled(node, active.id);
        }

        if active.started {
            active.continuation = Some(Box::new(session));
            entry.active = Some(active);
            Ok(())
        } else {
            // Its pipeline never ran a step; nothing left to drain
            log::debug!("{} superseded before starting", active.id);
            self.effects
                .finished(node, active.id, active.action, Completion::Canceled);
            self.start(node, session)
        }
    }

    fn queue_after(&mut self, node: NodeId, session: OperationSession) -> Result<()> {
        let entry = self.registry.get_mut(node)?;
        match entry.active.as_mut() {
            Some(active) => {
                active.push_tail(session);
                Ok(())
            }
            None => self.start(node, session),
        }
    }

    fn skip(&mut self, node: NodeId, mut session: OperationSession) -> Result<()> {
        let entry = self.registry.get_mut(node)?;
        match entry.active.as_mut() {
            Some(active) => session.callbacks.merge_into(&mut active.callbacks),
            None => {
                let drained = session.callbacks.drain();
                self.effects.completions.push((drained, Completion::Succeeded));
            }
        }
        Ok(())
    }

    /// Finish the active session if `operation` still owns it
    pub fn complete(&mut self, node: NodeId, operation: OperationId) -> Result<()> {
        let Ok(entry) = self.registry.get_mut(node) else {
            // Disposal already drained every callback
            return Ok(());
        };
        if !entry.owns(operation) {
            return Ok(());
        }
        let Some(mut session) = entry.active.take() else {
            return Ok(());
        };

        if session.canceled {
            entry.state = entry.previous_completed;
        } else {
            match session.action {
                Action::Expand => entry.expanded = true,
                Action::Collapse => entry.expanded = false,
                Action::Build => {}
            }
            entry.state = session.action.completed_state(entry.expanded);
        }

        let completion = session.completion();
        self.effects
            .finished(node, session.id, session.action, completion.clone());
        log::debug!("{} finished on {}: {:?}", session.id, node, completion);

        match session.continuation.take() {
            Some(next) => {
                let mut next = *next;
                session.callbacks.merge_into(&mut next.callbacks);
                self.start(node, next)
            }
            None => {
                let drained = session.callbacks.drain();
                self.effects.completions.push((drained, completion));
                Ok(())
            }
        }
    }

    /// Mark the pipeline as running; false if the session no longer owns the node
    pub fn begin(&mut self, node: NodeId, operation: OperationId) -> bool {
        let Ok(entry) = self.registry.get_mut(node) else {
            return false;
        };
        match entry.active.as_mut() {
            Some(session) if session.id == operation => {
                session.started = true;
                true
            }
            _ => false,
        }
    }

    /// Liveness guard checked by every step
    pub fn can_continue(&self, node: NodeId, operation: OperationId) -> bool {
        let Ok(entry) = self.registry.get(node) else {
            return false;
        };
        entry.state != NodeState::Disposed
            && entry
                .active
                .as_ref()
                .is_some_and(|session| session.id == operation && !session.canceled)
    }

    /// A step failed: the session is canceled and reports the failure
    pub fn fail(&mut self, node: NodeId, operation: OperationId, message: String) {
        let Ok(entry) = self.registry.get_mut(node) else {
            return;
        };
        let Some(session) = entry.active.as_mut() else {
            return;
        };
        if session.id != operation || session.canceled {
            return;
        }

        session.fail(message);
        entry.state = entry.previous_completed;
        self.effects.canceled(node, operation);
    }

    /// A listener vetoed the session
    pub fn cancel(&mut self, node: NodeId, operation: OperationId) {
        let Ok(entry) = self.registry.get_mut(node) else {
            return;
        };
        let Some(session) = entry.active.as_mut() else {
            return;
        };
        if session.id != operation || session.canceled {
            return;
        }

        log::debug!("{} vetoed on {}", operation, node);
        session.cancel();
        entry.state = entry.previous_completed;
        self.effects.canceled(node, operation);
    }

    /// Tear a node down, unlinking it from its parent
    pub fn dispose(&mut self, node: NodeId) -> Result<()> {
        if self.registry.state(node)? == NodeState::Disposed {
            return Ok(());
        }

        let parent = self.registry.get(node)?.parent;
        if let Some(parent) = parent {
            let parent = self.registry.get_mut(parent)?;
            if let Some(index) = parent.children.iter().position(|child| *child == node) {
                parent.children.remove(index);
                if index < parent.source_children.len() {
                    parent.source_children.remove(index);
                }
            }
        }

        self.dispose_subtree(node);
        Ok(())
    }

    /// Remove a node and its descendants from the arena
    ///
    /// The caller has already unlinked `node` from its parent.
    pub fn dispose_subtree(&mut self, node: NodeId) {
        let Some(mut entry) = self.registry.remove(node) else {
            return;
        };

        if let Some(mut active) = entry.active.take() {
            active.cancel();
            self.effects.cancels.push(active.handle.clone());
            self.effects.canceled(node, active.id);
            self.effects
                .finished(node, active.id, active.action, Completion::Canceled);

            let mut owed = CallbackStack::new();
            active.callbacks.merge_into(&mut owed);
            active.drain_chain_into(&mut owed);
            self.effects
                .completions
                .push((owed.drain(), Completion::Canceled));
        }

        for child in std::mem::take(&mut entry.children) {
            self.dispose_subtree(child);
        }

        log::info!("disposed {}", node);
        self.effects.detached.push(node);
        let tree_id = self.effects.tree_id().to_string();
        self.effects.emit(TreeEvent::NodeDisposed {
            tree_id,
            node_id: node,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::types::SourceRef;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<(&'static str, Completion)>>>;

    fn setup() -> (Registry, NodeId) {
        let registry = Registry::new(SourceRef::new("root"), &TreeConfig::default());
        let root = registry.root();
        (registry, root)
    }

    fn callback(log: &Log, label: &'static str) -> Option<OperationCallback> {
        let log = log.clone();
        Some(Box::new(move |completion| log.lock().push((label, completion))))
    }

    fn fire(effects: Effects) -> Vec<Launch> {
        for (drained, completion) in effects.completions {
            drained.fire_sequentially(&completion);
        }
        effects.launches
    }

    fn request(
        registry: &mut Registry,
        node: NodeId,
        request: Request,
        cb: Option<OperationCallback>,
    ) -> (Decision, Vec<Launch>) {
        let mut effects = Effects::new("tree-test");
        let decision = Scheduler::new(registry, &mut effects)
            .schedule(node, request, OperationArgs::new(), cb)
            .unwrap();
        (decision, fire(effects))
    }

    fn begin(registry: &mut Registry, launch: &Launch) -> bool {
        let mut effects = Effects::new("tree-test");
        Scheduler::new(registry, &mut effects).begin(launch.node, launch.operation)
    }

    fn complete(registry: &mut Registry, launch: &Launch) -> Vec<Launch> {
        let mut effects = Effects::new("tree-test");
        Scheduler::new(registry, &mut effects)
            .complete(launch.node, launch.operation)
            .unwrap();
        fire(effects)
    }

    fn labels(log: &Log) -> Vec<&'static str> {
        log.lock().iter().map(|(label, _)| *label).collect()
    }

    #[test]
    fn test_start_sets_in_progress_and_completes() {
        let (mut reg, root) = setup();
        let log = Log::default();

        let (decision, launches) =
            request(&mut reg, root, Request::Expand, callback(&log, "expand"));
        assert_eq!(decision, Decision::Start);
        assert_eq!(reg.state(root).unwrap(), NodeState::Expanding);
        assert_eq!(reg.get(root).unwrap().previous_completed, NodeState::None);

        assert!(begin(&mut reg, &launches[0]));
        assert!(complete(&mut reg, &launches[0]).is_empty());

        assert_eq!(reg.state(root).unwrap(), NodeState::Expanded);
        assert!(reg.get(root).unwrap().expanded);
        assert_eq!(*log.lock(), vec![("expand", Completion::Succeeded)]);
    }

    #[test]
    fn test_skip_without_active_fires_immediately() {
        let (mut reg, root) = setup();
        reg.get_mut(root).unwrap().state = NodeState::Collapsed;
        let log = Log::default();

        let (decision, launches) =
            request(&mut reg, root, Request::Collapse, callback(&log, "collapse"));

        assert_eq!(decision, Decision::Skip);
        assert!(launches.is_empty());
        assert_eq!(*log.lock(), vec![("collapse", Completion::Succeeded)]);
    }

    #[test]
    fn test_superseding_unstarted_build_runs_immediately() {
        let (mut reg, root) = setup();
        let log = Log::default();

        let (_, first) = request(&mut reg, root, Request::Build, callback(&log, "b1"));

        let mut effects = Effects::new("tree-test");
        let decision = Scheduler::new(&mut reg, &mut effects)
            .schedule(root, Request::Build, OperationArgs::new(), callback(&log, "b2"))
            .unwrap();
        assert_eq!(decision, Decision::CancelAndStart);
        // The superseded session is reported finished before its successor starts
        assert!(matches!(
            effects.events.as_slice(),
            [
                TreeEvent::OperationCanceled { operation_id: c, .. },
                TreeEvent::OperationFinished {
                    operation_id: f,
                    completion: Completion::Canceled,
                    ..
                },
                TreeEvent::OperationStarted { .. },
            ] if *c == first[0].operation && *f == first[0].operation
        ));
        let second = fire(effects);
        assert_eq!(second.len(), 1);

        // The first pipeline finds it no longer owns the node
        assert!(!begin(&mut reg, &first[0]));
        assert!(first[0].handle.is_canceled());

        assert!(begin(&mut reg, &second[0]));
        complete(&mut reg, &second[0]);
        assert_eq!(labels(&log), vec!["b1", "b2"]);
        assert!(log.lock().iter().all(|(_, c)| c.is_success()));
    }

    #[test]
    fn test_superseding_started_build_chains_continuation() {
        let (mut reg, root) = setup();
        let log = Log::default();

        let (_, first) = request(&mut reg, root, Request::Build, callback(&log, "b1"));
        assert!(begin(&mut reg, &first[0]));

        let (_, second) = request(&mut reg, root, Request::Build, callback(&log, "b2"));
        assert!(second.is_empty());
        assert!(first[0].handle.is_canceled());
        assert_eq!(reg.state(root).unwrap(), NodeState::None);

        let mut effects = Effects::new("tree-test");
        assert!(!Scheduler::new(&mut reg, &mut effects).can_continue(root, first[0].operation));

        let next = complete(&mut reg, &first[0]);
        assert_eq!(next.len(), 1);
        assert_eq!(reg.state(root).unwrap(), NodeState::Building);
        assert!(log.lock().is_empty());

        begin(&mut reg, &next[0]);
        complete(&mut reg, &next[0]);
        assert_eq!(labels(&log), vec!["b1", "b2"]);
        assert_eq!(reg.state(root).unwrap(), NodeState::Collapsed);
    }

    #[test]
    fn test_fifo_across_decisions() {
        let (mut reg, root) = setup();
        let log = Log::default();

        // Start, QueueAfter twice, then CancelAndStart against the chain
        let (_, expand) = request(&mut reg, root, Request::Expand, callback(&log, "r1"));
        begin(&mut reg, &expand[0]);
        let (d2, _) = request(&mut reg, root, Request::Build, callback(&log, "r2"));
        let (d3, _) = request(&mut reg, root, Request::Expand, callback(&log, "r3"));
        let (d4, _) = request(&mut reg, root, Request::Collapse, callback(&log, "r4"));
        assert_eq!(
            (d2, d3, d4),
            (Decision::QueueAfter, Decision::QueueAfter, Decision::CancelAndStart)
        );

        let collapse = complete(&mut reg, &expand[0]);
        begin(&mut reg, &collapse[0]);
        complete(&mut reg, &collapse[0]);

        assert_eq!(labels(&log), vec!["r1", "r2", "r3", "r4"]);
        assert_eq!(reg.state(root).unwrap(), NodeState::Collapsed);
    }

    #[test]
    fn test_veto_rolls_back() {
        let (mut reg, root) = setup();
        reg.get_mut(root).unwrap().state = NodeState::Collapsed;
        let log = Log::default();

        let (_, launches) = request(&mut reg, root, Request::Expand, callback(&log, "expand"));
        begin(&mut reg, &launches[0]);

        let mut effects = Effects::new("tree-test");
        Scheduler::new(&mut reg, &mut effects).cancel(root, launches[0].operation);
        assert_eq!(reg.state(root).unwrap(), NodeState::Collapsed);

        complete(&mut reg, &launches[0]);
        assert_eq!(reg.state(root).unwrap(), NodeState::Collapsed);
        assert!(!reg.get(root).unwrap().expanded);
        assert_eq!(*log.lock(), vec![("expand", Completion::Canceled)]);
    }

    #[test]
    fn test_failure_reported() {
        let (mut reg, root) = setup();
        let log = Log::default();

        let (_, launches) = request(&mut reg, root, Request::Build, callback(&log, "build"));
        begin(&mut reg, &launches[0]);

        let mut effects = Effects::new("tree-test");
        Scheduler::new(&mut reg, &mut effects).fail(root, launches[0].operation, "boom".into());
        complete(&mut reg, &launches[0]);

        assert_eq!(reg.state(root).unwrap(), NodeState::None);
        assert_eq!(
            *log.lock(),
            vec![("build", Completion::Failed { error: "boom".into() })]
        );
    }

    #[test]
    fn test_dispose_cancels_owed_callbacks_and_rejects() {
        let (mut reg, root) = setup();
        let log = Log::default();

        let (_, launches) = request(&mut reg, root, Request::Expand, callback(&log, "r1"));
        begin(&mut reg, &launches[0]);
        request(&mut reg, root, Request::Build, callback(&log, "r2"));

        let mut effects = Effects::new("tree-test");
        Scheduler::new(&mut reg, &mut effects).dispose(root).unwrap();
        assert_eq!(effects.detached, vec![root]);
        assert!(effects.events.iter().any(|event| matches!(
            event,
            TreeEvent::OperationFinished { operation_id, completion: Completion::Canceled, .. }
                if *operation_id == launches[0].operation
        )));
        assert!(effects.cancels.iter().all(CancelHandle::is_canceled));
        fire(effects);

        assert_eq!(labels(&log), vec!["r1", "r2"]);
        assert!(log.lock().iter().all(|(_, c)| *c == Completion::Canceled));
        assert_eq!(reg.state(root).unwrap(), NodeState::Disposed);

        // The stale pipeline finishing is a no-op
        assert!(complete(&mut reg, &launches[0]).is_empty());

        let (decision, _) = request(&mut reg, root, Request::Toggle, callback(&log, "r3"));
        assert_eq!(decision, Decision::Reject);
        assert_eq!(log.lock().last().map(|(l, _)| *l), Some("r3"));
    }

    #[test]
    fn test_unknown_node_is_error() {
        let (mut reg, _) = setup();
        let mut effects = Effects::new("tree-test");
        let result = Scheduler::new(&mut reg, &mut effects).schedule(
            NodeId(42),
            Request::Build,
            OperationArgs::new(),
            None,
        );
        assert!(matches!(result, Err(crate::error::TreeError::NodeNotFound(_))));
    }

    #[test]
    fn test_toggle_follows_pending_action() {
        let (mut reg, root) = setup();
        let (_, expand) = request(&mut reg, root, Request::Toggle, None);
        assert_eq!(expand[0].action, Action::Expand);
        begin(&mut reg, &expand[0]);

        // Toggling while expanding collapses
        let (decision, _) = request(&mut reg, root, Request::Toggle, None);
        assert_eq!(decision, Decision::CancelAndStart);
        let collapse = complete(&mut reg, &expand[0]);
        assert_eq!(collapse[0].action, Action::Collapse);
    }
}
