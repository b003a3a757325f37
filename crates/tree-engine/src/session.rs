//! Operation sessions
//!
//! A session is one requested action bound to a node. Sessions form a
//! singly linked continuation chain hanging off the node's active slot.

use crate::callbacks::{CallbackStack, OperationCallback};
use crate::pipeline::CancelHandle;
use crate::types::{Action, Completion, OperationArgs, OperationId};

#[derive(Debug)]
pub(crate) struct OperationSession {
    pub id: OperationId,
    pub action: Action,
    /// Set once, never cleared
    pub canceled: bool,
    /// First step failure, if any
    pub failure: Option<String>,
    /// The pipeline has begun executing
    pub started: bool,
    pub continuation: Option<Box<OperationSession>>,
    pub callbacks: CallbackStack,
    pub args: OperationArgs,
    pub handle: CancelHandle,
}

impl OperationSession {
    pub fn new(
        id: OperationId,
        action: Action,
        args: OperationArgs,
        callback: Option<OperationCallback>,
    ) -> Self {
        let mut callbacks = CallbackStack::new();
        if let Some(callback) = callback {
            callbacks.append(id, callback);
        }

        Self {
            id,
            action,
            canceled: false,
            failure: None,
            started: false,
            continuation: None,
            callbacks,
            args,
            handle: CancelHandle::new(),
        }
    }

    /// Mark canceled and signal the pipeline
    pub fn cancel(&mut self) {
        self.canceled = true;
        self.handle.cancel();
    }

    /// Record a step failure; the session is then canceled
    pub fn fail(&mut self, message: String) {
        if self.failure.is_none() {
            self.failure = Some(message);
        }
        self.cancel();
    }

    /// Completion handed to every callback this session drains
    pub fn completion(&self) -> Completion {
        match (&self.failure, self.canceled) {
            (Some(error), _) => Completion::Failed {
                error: error.clone(),
            },
            (None, true) => Completion::Canceled,
            (None, false) => Completion::Succeeded,
        }
    }

    /// Append a session at the end of the continuation chain
    pub fn push_tail(&mut self, session: OperationSession) {
        match self.continuation.as_deref_mut() {
            Some(next) => next.push_tail(session),
            None => self.continuation = Some(Box::new(session)),
        }
    }

    /// Action of the last non-canceled session in the chain
    pub fn effective_action(&self) -> Option<Action> {
        let mut effective = (!self.canceled).then_some(self.action);
        let mut next = self.continuation.as_deref();
        while let Some(session) = next {
            if !session.canceled {
                effective = Some(session.action);
            }
            next = session.continuation.as_deref();
        }
        effective
    }

    /// Take every callback owed by the chained continuations, in chain order
    pub fn drain_chain_into(&mut self, target: &mut CallbackStack) {
        let mut next = self.continuation.take();
        while let Some(mut session) = next {
            session.callbacks.merge_into(target);
            next = session.continuation.take();
        }
    }
}
