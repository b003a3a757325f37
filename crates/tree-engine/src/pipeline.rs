//! Ordered step pipeline
//!
//! A pipeline runs a list of named steps one after another. Event steps are
//! synchronous and receive mutable [`StepArgs`]; job steps are asynchronous
//! and the pipeline only advances once the job's future resolves.
//!
//! Cancellation is cooperative: a cancel request (from a [`CancelHandle`], an
//! event that sets `cancel`, or a failing step) is observed between steps,
//! at which point the pipeline fast-forwards to its terminal step and runs
//! it. The terminal step always runs so the owner can finish its bookkeeping.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::constants::steps;
use crate::error::{Result, TreeError};

/// Shared cancel request flag for one pipeline
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    requested: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Synchronous event delivered to node-scope listeners
    Event,
    /// Synchronous event delivered to tree-scope listeners
    GlobalEvent,
    /// Asynchronous unit of work
    Job,
}

/// Pipeline-native arguments of an event step
#[derive(Debug, Clone, Default)]
pub struct StepArgs {
    pub name: String,
    pub key: String,
    /// Request cancellation of the whole pipeline
    pub cancel: bool,
    /// Skip the global step sharing this event's name
    pub stop_propagation: bool,
    /// The pipeline context, moved in for the duration of the step
    pub data: Value,
}

pub type EventHandler = Box<dyn FnOnce(&mut StepArgs) -> Result<()> + Send>;
pub type JobHandler = Box<dyn FnOnce(Value) -> BoxFuture<'static, Result<()>> + Send>;

pub enum StepHandler {
    Event(EventHandler),
    Job(JobHandler),
}

/// A named pipeline step
pub struct Step {
    kind: StepKind,
    name: &'static str,
    key: String,
    handler: Option<StepHandler>,
}

impl Step {
    pub fn event<F>(name: &'static str, handler: F) -> Self
    where
        F: FnOnce(&mut StepArgs) -> Result<()> + Send + 'static,
    {
        Self {
            kind: StepKind::Event,
            name,
            key: name.to_string(),
            handler: Some(StepHandler::Event(Box::new(handler))),
        }
    }

    pub fn global_event<F>(name: &'static str, handler: F) -> Self
    where
        F: FnOnce(&mut StepArgs) -> Result<()> + Send + 'static,
    {
        Self {
            kind: StepKind::GlobalEvent,
            name,
            key: format!("{}{}", steps::GLOBAL_PREFIX, name),
            handler: Some(StepHandler::Event(Box::new(handler))),
        }
    }

    /// A job receives a copy of the pipeline context; resolving its future
    /// resolves the step
    pub fn job<F, Fut>(name: &'static str, handler: F) -> Self
    where
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            kind: StepKind::Job,
            name,
            key: name.to_string(),
            handler: Some(StepHandler::Job(Box::new(move |context| {
                Box::pin(handler(context))
            }))),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// What happened during one pipeline run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    /// Keys of steps whose handlers ran, in order
    pub executed: Vec<String>,
    /// Keys of steps passed over by the fast-forward
    pub skipped: Vec<String>,
    pub canceled: bool,
    pub errors: Vec<String>,
}

/// Sequential step runner for one node operation
pub struct StepPipeline {
    steps: Vec<Step>,
    cursor: usize,
    terminal: Option<String>,
    handle: CancelHandle,
    context: Value,
    stopped: HashSet<&'static str>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
    on_error: Option<Box<dyn FnMut(&TreeError) + Send>>,
}

impl StepPipeline {
    pub fn new(handle: CancelHandle) -> Self {
        Self {
            steps: Vec::new(),
            cursor: 0,
            terminal: None,
            handle,
            context: Value::Null,
            stopped: HashSet::new(),
            on_cancel: None,
            on_error: None,
        }
    }

    /// Set the value threaded through every step
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Key of the step a canceled pipeline fast-forwards to
    ///
    /// Without one, the last step is terminal.
    pub fn with_terminal(mut self, key: impl Into<String>) -> Self {
        self.terminal = Some(key.into());
        self
    }

    pub fn add_step(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Move the cursor to the step with the given key
    pub fn seek(&mut self, key: &str) -> Result<()> {
        let index = self
            .position(key)
            .ok_or_else(|| TreeError::UnknownStep(key.to_string()))?;
        self.cursor = index;
        Ok(())
    }

    /// Called once, when a cancel request is first observed
    pub fn on_cancel<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_cancel = Some(Box::new(handler));
        self
    }

    /// Called for every failing step; the pipeline then cancels itself
    pub fn on_error<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&TreeError) + Send + 'static,
    {
        self.on_error = Some(Box::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.key == key)
    }

    fn terminal_index(&self) -> usize {
        self.terminal
            .as_deref()
            .and_then(|key| self.position(key))
            .unwrap_or_else(|| self.steps.len().saturating_sub(1))
    }

    /// Run the remaining steps to the end
    pub async fn execute(mut self) -> PipelineReport {
        let mut report = PipelineReport::default();
        let mut fast_forwarded = false;

        while self.cursor < self.steps.len() {
            if !fast_forwarded && self.handle.is_canceled() {
                fast_forwarded = true;
                report.canceled = true;
                if let Some(on_cancel) = self.on_cancel.take() {
                    on_cancel();
                }

                let target = self.terminal_index();
                if target > self.cursor {
                    report.skipped.extend(
                        self.steps[self.cursor..target]
                            .iter()
                            .map(|step| step.key.clone()),
                    );
                    self.cursor = target;
                }
            }

            let index = self.cursor;
            self.cursor += 1;

            let step = &mut self.steps[index];
            let Some(handler) = step.handler.take() else {
                continue;
            };
            let (kind, name, key) = (step.kind, step.name, step.key.clone());

            log::trace!("pipeline step '{}' ({:?})", key, kind);
            let result = self.run_step(kind, name, &key, handler).await;
            report.executed.push(key);

            if let Err(err) = result {
                report.errors.push(err.to_string());
                if let Some(on_error) = self.on_error.as_mut() {
                    on_error(&err);
                }
                self.handle.cancel();
            }
        }

        report
    }

    async fn run_step(
        &mut self,
        kind: StepKind,
        name: &'static str,
        key: &str,
        handler: StepHandler,
    ) -> Result<()> {
        match handler {
            StepHandler::Event(handler) => {
                if kind == StepKind::GlobalEvent && self.stopped.contains(name) {
                    return Ok(());
                }

                let mut args = StepArgs {
                    name: name.to_string(),
                    key: key.to_string(),
                    cancel: false,
                    stop_propagation: false,
                    data: std::mem::take(&mut self.context),
                };
                let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut args)))
                    .unwrap_or_else(|payload| Err(panicked(name, payload)));

                if args.stop_propagation {
                    self.stopped.insert(name);
                }
                if args.cancel {
                    self.handle.cancel();
                }
                self.context = args.data;
                result
            }
            StepHandler::Job(job) => {
                let context = self.context.clone();
                match panic::catch_unwind(AssertUnwindSafe(|| job(context))) {
                    Ok(future) => AssertUnwindSafe(future)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| Err(panicked(name, payload))),
                    Err(payload) => Err(panicked(name, payload)),
                }
            }
        }
    }
}

/// A panicking step fails like any other step
fn panicked(step: &str, payload: Box<dyn Any + Send>) -> TreeError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    TreeError::step_failed(step, format!("panicked: {}", message))
}
