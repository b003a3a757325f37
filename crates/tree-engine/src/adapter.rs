//! Execution pipeline adapter
//!
//! Turns a launched session into a [`StepPipeline`] and drives it. Every
//! step except `finish` starts with the liveness guard, so a session that was
//! superseded, vetoed, failed, or whose node was disposed turns the rest of
//! its steps into no-ops and still reaches `finish`.

use futures_util::future::join_all;

use crate::constants::steps;
use crate::error::{Result, TreeError};
use crate::listeners::ListenerScope;
use crate::pipeline::{Step, StepArgs, StepPipeline};
use crate::scheduler::Launch;
use crate::tree::Tree;
use crate::types::{Action, Completion, NodeId, OperationArgs, OperationId, Request};

/// What every step closure needs to reach its session
#[derive(Clone)]
struct SessionRef {
    tree: Tree,
    node: NodeId,
    operation: OperationId,
    action: Action,
}

impl SessionRef {
    fn can_continue(&self) -> bool {
        self.tree.can_continue(self.node, self.operation)
    }
}

/// Run one session's pipeline to its finish step
pub(crate) async fn run_session(tree: Tree, launch: Launch) {
    let Launch {
        node,
        operation,
        action,
        args,
        handle,
    } = launch;

    if !tree.begin(node, operation) {
        log::debug!("{} on {} was superseded before it began", operation, node);
        return;
    }

    let session = SessionRef {
        tree: tree.clone(),
        node,
        operation,
        action,
    };
    let recursive = args.recursive;

    let mut pipeline = StepPipeline::new(handle)
        .with_context(args.context)
        .with_terminal(steps::FINISH);

    let failing = session.clone();
    pipeline
        .on_cancel(move || {
            log::debug!("{} on {} canceled, skipping to finish", operation, node)
        })
        .on_error(move |err: &TreeError| {
            log::warn!(
                "{} {} on {} failed: {}",
                failing.operation,
                failing.action,
                failing.node,
                err
            );
            failing
                .tree
                .fail(failing.node, failing.operation, err.to_string());
        });

    match action {
        Action::Build => add_build_steps(&mut pipeline, &session, recursive),
        Action::Expand => {
            add_event_steps(&mut pipeline, &session, steps::EXPANDING, true);
            add_build_steps(&mut pipeline, &session, recursive);
            pipeline.add_step(visibility_job(&session, steps::EXPAND, true));
            add_event_steps(&mut pipeline, &session, steps::EXPANDED, false);
        }
        Action::Collapse => {
            add_event_steps(&mut pipeline, &session, steps::COLLAPSING, true);
            pipeline.add_step(visibility_job(&session, steps::COLLAPSE, false));
            add_event_steps(&mut pipeline, &session, steps::COLLAPSED, false);
        }
    }

    let finishing = session.clone();
    pipeline.add_step(Step::job(steps::FINISH, move |_| async move {
        finishing.tree.complete(finishing.node, finishing.operation);
        Ok(())
    }));

    let report = pipeline.execute().await;
    log::debug!(
        "{} on {} ran {} steps ({} skipped, canceled: {})",
        operation,
        node,
        report.executed.len(),
        report.skipped.len(),
        report.canceled
    );
}

/// Node-scope then tree-scope step for one event
fn add_event_steps(
    pipeline: &mut StepPipeline,
    session: &SessionRef,
    name: &'static str,
    cancelable: bool,
) {
    for scope in [ListenerScope::Node, ListenerScope::Tree] {
        let session = session.clone();
        let handler = move |args: &mut StepArgs| -> Result<()> {
            if session.can_continue() {
                session.tree.dispatch_event(
                    session.node,
                    session.operation,
                    session.action,
                    scope,
                    cancelable,
                    args,
                );
            }
            Ok(())
        };

        let step = match scope {
            ListenerScope::Node => Step::event(name, handler),
            ListenerScope::Tree => Step::global_event(name, handler),
        };
        pipeline.add_step(step);
    }
}

fn add_build_steps(pipeline: &mut StepPipeline, session: &SessionRef, recursive: Option<bool>) {
    add_event_steps(pipeline, session, steps::BUILDING, true);

    let building = session.clone();
    pipeline.add_step(Step::job(steps::BUILD, move |_| async move {
        if !building.can_continue() {
            return Ok(());
        }
        build_node(&building, recursive)
            .await
            .map_err(|err| TreeError::step_failed(steps::BUILD, err.to_string()))
    }));

    add_event_steps(pipeline, session, steps::BUILT, false);
}

/// Rebind content, reconcile children if called for, and build them
async fn build_node(session: &SessionRef, recursive: Option<bool>) -> Result<()> {
    let tree = &session.tree;
    let node = session.node;

    let source = tree.source(node)?;
    tree.renderer().render_content(node, &source).await?;
    if !session.can_continue() {
        return Ok(());
    }

    let Some(plan) = tree.reconcile_children(node, session.action, recursive)? else {
        return Ok(());
    };
    tree.renderer()
        .render_children(node, &plan.outcome.children)
        .await?;
    if !session.can_continue() {
        return Ok(());
    }

    // Child builds go through the scheduler like any other request
    let args = OperationArgs::new().recursive(plan.child_recursive);
    let mut pending = Vec::with_capacity(plan.outcome.rebuild.len());
    for child in plan.outcome.rebuild {
        match tree.request_awaitable(child, Request::Build, args.clone()) {
            Ok(receiver) => pending.push(async move { (child, receiver.await) }),
            Err(err) => log::warn!("could not schedule build of {}: {}", child, err),
        }
    }

    for (child, result) in join_all(pending).await {
        match result {
            Ok(Completion::Failed { error }) => {
                log::warn!("child {} of {} failed to build: {}", child, node, error)
            }
            Ok(_) => {}
            Err(_) => log::warn!("build of child {} was dropped", child),
        }
    }
    Ok(())
}

/// Show or hide children, then wait out the transition
fn visibility_job(session: &SessionRef, name: &'static str, expanded: bool) -> Step {
    let session = session.clone();
    Step::job(name, move |_| async move {
        if !session.can_continue() {
            return Ok(());
        }

        session
            .tree
            .renderer()
            .set_expanded(session.node, expanded)
            .await
            .map_err(|err| TreeError::step_failed(name, err.to_string()))?;

        let transition = session
            .tree
            .options(session.node)
            .ok()
            .and_then(|options| options.transition());
        if let Some(duration) = transition {
            tokio::time::sleep(duration).await;
        }
        Ok(())
    })
}
