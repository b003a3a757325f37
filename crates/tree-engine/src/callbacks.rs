//! Completion callback stacks
//!
//! Every operation carries one optional callback. When sessions are merged
//! (a redundant request joins an in-flight session, or a superseding session
//! inherits the stack of the one it replaced) their callbacks travel together
//! and are drained exactly once, in operation-id order.

use crate::types::{Completion, OperationId};

/// Callback fired once with the completion of the session that drained it
pub type OperationCallback = Box<dyn FnOnce(Completion) + Send>;

#[derive(Default)]
pub struct CallbackStack {
    entries: Vec<(OperationId, OperationCallback)>,
}

impl CallbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, operation: OperationId, callback: OperationCallback) {
        self.entries.push((operation, callback));
    }

    /// Move every entry of `self` into `target`
    pub fn merge_into(&mut self, target: &mut CallbackStack) {
        target.entries.append(&mut self.entries);
    }

    /// Empty the stack, ordered by operation id
    pub fn drain(&mut self) -> DrainedCallbacks {
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by_key(|(operation, _)| *operation);
        DrainedCallbacks { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn operation_ids(&self) -> Vec<OperationId> {
        self.entries.iter().map(|(operation, _)| *operation).collect()
    }
}

impl std::fmt::Debug for CallbackStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackStack")
            .field("operations", &self.operation_ids())
            .finish()
    }
}

/// Callbacks taken out of a stack, waiting to be fired outside the registry lock
#[derive(Default)]
pub struct DrainedCallbacks {
    entries: Vec<(OperationId, OperationCallback)>,
}

impl DrainedCallbacks {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fire each callback in order, handing every one the same completion
    pub fn fire_sequentially(self, completion: &Completion) {
        for (operation, callback) in self.entries {
            log::trace!("completing {} with {:?}", operation, completion);
            callback(completion.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recording(log: &Arc<Mutex<Vec<(u64, Completion)>>>, id: u64) -> OperationCallback {
        let log = log.clone();
        Box::new(move |completion| log.lock().push((id, completion)))
    }

    #[test]
    fn test_drain_orders_by_operation_id() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut late = CallbackStack::new();
        late.append(OperationId(5), recording(&log, 5));

        let mut early = CallbackStack::new();
        early.append(OperationId(2), recording(&log, 2));
        early.append(OperationId(3), recording(&log, 3));

        late.merge_into(&mut early);
        assert!(late.is_empty());
        assert_eq!(early.len(), 3);

        early.append(OperationId(4), recording(&log, 4));
        early.drain().fire_sequentially(&Completion::Canceled);

        let order: Vec<u64> = log.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![2, 3, 4, 5]);
        assert!(log.lock().iter().all(|(_, c)| *c == Completion::Canceled));
        assert!(early.is_empty());
    }

    #[test]
    fn test_drain_is_exactly_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CallbackStack::new();
        stack.append(OperationId(1), recording(&log, 1));

        let drained = stack.drain();
        assert_eq!(drained.len(), 1);
        assert!(stack.drain().is_empty());

        drained.fire_sequentially(&Completion::Succeeded);
        assert_eq!(log.lock().len(), 1);
    }
}
