//! Action resolution
//!
//! Pure decision functions: what to do with a requested action given the
//! node's current state, and what a toggle means at this moment.

use serde::{Deserialize, Serialize};

use crate::types::{Action, NodeState};

/// What the scheduler does with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Run a new session now
    Start,
    /// Cancel the in-flight session and run this one as its continuation
    CancelAndStart,
    /// Run after everything already chained
    QueueAfter,
    /// Redundant; the callback fires with the active session's completion
    Skip,
    /// The node is disposed; the callback fires as canceled
    Reject,
}

/// Decide how a request against a node in `state` is scheduled
pub fn resolve(state: NodeState, action: Action) -> Decision {
    use Action::*;
    use Decision::*;

    match (state, action) {
        (NodeState::Disposed, _) => Reject,

        (NodeState::None, _) => Start,

        (NodeState::Building, Build) => CancelAndStart,
        (NodeState::Building, Expand | Collapse) => QueueAfter,

        (NodeState::Collapsed, Build | Expand) => Start,
        (NodeState::Collapsed, Collapse) => Skip,

        (NodeState::Collapsing, Build) => QueueAfter,
        (NodeState::Collapsing, Expand) => CancelAndStart,
        (NodeState::Collapsing, Collapse) => Skip,

        (NodeState::Expanded, Build | Collapse) => Start,
        (NodeState::Expanded, Expand) => Skip,

        (NodeState::Expanding, Build | Expand) => QueueAfter,
        (NodeState::Expanding, Collapse) => CancelAndStart,
    }
}

/// Resolve a toggle into a concrete action
///
/// `pending` is the action that will determine the node's final state, if
/// any operation is in flight. Builds have no opposite, so they fall back to
/// the visibility flag like an idle node does.
pub fn resolve_toggle(pending: Option<Action>, expanded: bool) -> Action {
    match pending.and_then(Action::opposite) {
        Some(action) => action,
        None if expanded => Action::Collapse,
        None => Action::Expand,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_is_total() {
        for state in NodeState::ALL {
            for action in Action::ALL {
                let decision = resolve(state, action);
                if state == NodeState::Disposed {
                    assert_eq!(decision, Decision::Reject, "{state:?}/{action:?}");
                } else {
                    assert_ne!(decision, Decision::Reject, "{state:?}/{action:?}");
                }
            }
        }
    }

    #[test]
    fn test_decision_table() {
        use Decision::*;
        let table = [
            (NodeState::None, [Start, Start, Start]),
            (NodeState::Building, [CancelAndStart, QueueAfter, QueueAfter]),
            (NodeState::Collapsed, [Start, Start, Skip]),
            (NodeState::Collapsing, [QueueAfter, CancelAndStart, Skip]),
            (NodeState::Expanded, [Start, Skip, Start]),
            (NodeState::Expanding, [QueueAfter, QueueAfter, CancelAndStart]),
        ];

        for (state, row) in table {
            for (action, expected) in Action::ALL.into_iter().zip(row) {
                assert_eq!(resolve(state, action), expected, "{state:?}/{action:?}");
            }
        }
    }

    #[test]
    fn test_opposites_preempt() {
        assert_eq!(
            resolve(NodeState::Collapsing, Action::Expand),
            Decision::CancelAndStart
        );
        assert_eq!(
            resolve(NodeState::Expanding, Action::Collapse),
            Decision::CancelAndStart
        );
    }

    #[test]
    fn test_toggle_resolution() {
        assert_eq!(resolve_toggle(None, false), Action::Expand);
        assert_eq!(resolve_toggle(None, true), Action::Collapse);
        assert_eq!(resolve_toggle(Some(Action::Expand), false), Action::Collapse);
        assert_eq!(resolve_toggle(Some(Action::Collapse), true), Action::Expand);
        assert_eq!(resolve_toggle(Some(Action::Build), true), Action::Collapse);
        assert_eq!(resolve_toggle(Some(Action::Build), false), Action::Expand);
    }
}
