//! Child-list reconciliation
//!
//! Resynchronizes a node's ordered child registry with the latest collection
//! of source children. Sources are matched by identity. Retained children
//! keep their node (and with it any state or in-flight operation), new
//! sources get new nodes, and removed children are disposed only after
//! every index has been remapped.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeError};
use crate::events::TreeEvent;
use crate::registry::Registry;
use crate::scheduler::{Effects, Scheduler};
use crate::types::{NodeId, SourceRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    /// Order relative to the other retained items changed
    Moved,
    /// Only the absolute index changed
    Shifted,
}

/// One edit between two source collections
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
    pub value: SourceRef,
}

impl ChangeRecord {
    pub fn added(index: usize, value: SourceRef) -> Self {
        Self {
            kind: ChangeKind::Added,
            old_index: None,
            new_index: Some(index),
            value,
        }
    }

    pub fn removed(index: usize, value: SourceRef) -> Self {
        Self {
            kind: ChangeKind::Removed,
            old_index: Some(index),
            new_index: None,
            value,
        }
    }

    pub fn relocated(kind: ChangeKind, from: usize, to: usize, value: SourceRef) -> Self {
        Self {
            kind,
            old_index: Some(from),
            new_index: Some(to),
            value,
        }
    }
}

/// Produces the edits turning `previous` into `current`
///
/// Called while the tree's registry is locked; implementations must not call
/// back into the tree.
pub trait ChangeObserver: Send + Sync {
    fn changes(&self, previous: &[SourceRef], current: &[SourceRef]) -> Vec<ChangeRecord>;
}

/// Identity-based diff used when no other observer is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityObserver;

impl ChangeObserver for IdentityObserver {
    fn changes(&self, previous: &[SourceRef], current: &[SourceRef]) -> Vec<ChangeRecord> {
        diff(previous, current)
    }
}

/// Identity diff of two source collections
///
/// Untouched items (same position) produce no record. Among retained items,
/// the longest run already in order is reported as `Shifted` when its index
/// changed; everything else retained is `Moved`.
pub fn diff(previous: &[SourceRef], current: &[SourceRef]) -> Vec<ChangeRecord> {
    let mut unmatched: HashMap<usize, VecDeque<usize>> = HashMap::new();
    for (index, source) in previous.iter().enumerate() {
        unmatched.entry(source.identity()).or_default().push_back(index);
    }

    let matched: Vec<Option<usize>> = current
        .iter()
        .map(|source| {
            unmatched
                .get_mut(&source.identity())
                .and_then(VecDeque::pop_front)
        })
        .collect();

    let mut records = Vec::new();

    let mut retained = vec![false; previous.len()];
    for old in matched.iter().flatten() {
        retained[*old] = true;
    }
    for (index, kept) in retained.iter().enumerate() {
        if !kept {
            records.push(ChangeRecord::removed(index, previous[index].clone()));
        }
    }

    let order: Vec<usize> = matched.iter().flatten().copied().collect();
    let in_order = longest_increasing(&order);
    let mut rank = 0;

    for (new_index, old) in matched.iter().enumerate() {
        let value = current[new_index].clone();
        match old {
            None => records.push(ChangeRecord::added(new_index, value)),
            Some(old_index) => {
                let stable = in_order[rank];
                rank += 1;
                if !stable {
                    records.push(ChangeRecord::relocated(
                        ChangeKind::Moved,
                        *old_index,
                        new_index,
                        value,
                    ));
                } else if *old_index != new_index {
                    records.push(ChangeRecord::relocated(
                        ChangeKind::Shifted,
                        *old_index,
                        new_index,
                        value,
                    ));
                }
            }
        }
    }

    records
}

/// Membership mask of one longest strictly increasing subsequence
fn longest_increasing(values: &[usize]) -> Vec<bool> {
    // tails[k]: index into `values` of the smallest tail of a run of length k + 1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; values.len()];

    for (i, value) in values.iter().enumerate() {
        let pos = tails.partition_point(|&t| values[t] < *value);
        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }

    let mut mask = vec![false; values.len()];
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        mask[i] = true;
        cursor = prev[i];
    }
    mask
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The settled child registry
    pub children: Vec<NodeId>,
    /// New and relocated children, in child order
    pub rebuild: Vec<NodeId>,
    pub added: usize,
    pub relocated: usize,
    pub removed: usize,
}

enum Slot {
    Existing(NodeId),
    New(SourceRef),
}

/// Bring `node`'s child registry in line with `current`
pub(crate) fn reconcile(
    registry: &mut Registry,
    effects: &mut Effects,
    node: NodeId,
    current: Vec<SourceRef>,
    observer: &dyn ChangeObserver,
) -> Result<ReconcileOutcome> {
    let entry = registry.get(node)?;
    let previous_children = entry.children.clone();
    let previous = entry.source_children.clone();

    let mut outcome = ReconcileOutcome::default();
    let (slots, removed) = if previous.is_empty() {
        let slots = current.iter().cloned().map(Slot::New).collect();
        (slots, Vec::new())
    } else if current.is_empty() {
        (Vec::new(), previous_children.clone())
    } else {
        let records = observer.changes(&previous, &current);
        plan(node, &previous_children, &previous, &current, &records)?
    };

    let scope = registry.child_scope(node)?;
    let mut children = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Slot::Existing(child) => {
                if previous_children.iter().position(|c| *c == child) != Some(children.len()) {
                    outcome.relocated += 1;
                    outcome.rebuild.push(child);
                }
                children.push(child);
            }
            Slot::New(source) => {
                let child = registry.create_child(node, source, &scope)?;
                outcome.added += 1;
                outcome.rebuild.push(child);
                children.push(child);
            }
        }
    }

    let entry = registry.get_mut(node)?;
    entry.children = children.clone();
    entry.source_children = current;

    let mut scheduler = Scheduler::new(registry, effects);
    for child in &removed {
        scheduler.dispose_subtree(*child);
    }

    outcome.removed = removed.len();
    outcome.children = children;

    if outcome.added + outcome.relocated + outcome.removed > 0 {
        log::info!(
            "reconciled {}: {} added, {} relocated, {} removed",
            node,
            outcome.added,
            outcome.relocated,
            outcome.removed
        );
    }
    let tree_id = effects.tree_id().to_string();
    effects.emit(TreeEvent::ChildrenReconciled {
        tree_id,
        node_id: node,
        added: outcome.added,
        relocated: outcome.relocated,
        removed: outcome.removed,
    });

    Ok(outcome)
}

/// Validate change records and lay out the new child slots
///
/// Nothing is mutated here, so inconsistent records leave the registry as it was.
fn plan(
    node: NodeId,
    previous_children: &[NodeId],
    previous: &[SourceRef],
    current: &[SourceRef],
    records: &[ChangeRecord],
) -> Result<(Vec<Slot>, Vec<NodeId>)> {
    let inconsistent = |reason: String| TreeError::InconsistentChanges { node, reason };

    let mut slots: Vec<Option<Slot>> = (0..current.len()).map(|_| None).collect();
    let mut claimed = vec![false; previous.len()];
    let mut removed = Vec::new();

    let old_index = |record: &ChangeRecord| -> Result<usize> {
        match record.old_index {
            Some(index) if index < previous.len() && previous[index].same(&record.value) => {
                Ok(index)
            }
            other => Err(inconsistent(format!(
                "{:?} record has bad old index {:?}",
                record.kind, other
            ))),
        }
    };
    let new_index = |record: &ChangeRecord| -> Result<usize> {
        match record.new_index {
            Some(index) if index < current.len() && current[index].same(&record.value) => {
                Ok(index)
            }
            other => Err(inconsistent(format!(
                "{:?} record has bad new index {:?}",
                record.kind, other
            ))),
        }
    };

    for record in records {
        match record.kind {
            ChangeKind::Removed => {
                let from = old_index(record)?;
                if std::mem::replace(&mut claimed[from], true) {
                    return Err(inconsistent(format!("old index {from} used twice")));
                }
                removed.push(previous_children[from]);
            }
            ChangeKind::Added => {
                let to = new_index(record)?;
                if slots[to].is_some() {
                    return Err(inconsistent(format!("new index {to} filled twice")));
                }
                slots[to] = Some(Slot::New(record.value.clone()));
            }
            ChangeKind::Moved | ChangeKind::Shifted => {
                let from = old_index(record)?;
                let to = new_index(record)?;
                if std::mem::replace(&mut claimed[from], true) {
                    return Err(inconsistent(format!("old index {from} used twice")));
                }
                if slots[to].is_some() {
                    return Err(inconsistent(format!("new index {to} filled twice")));
                }
                slots[to] = Some(Slot::Existing(previous_children[from]));
            }
        }
    }

    // Items without a record stay where they were
    for (index, taken) in claimed.iter().enumerate() {
        if *taken {
            continue;
        }
        let in_place = index < current.len()
            && slots[index].is_none()
            && current[index].same(&previous[index]);
        if !in_place {
            return Err(inconsistent(format!(
                "unrecorded child at old index {index} does not stay in place"
            )));
        }
        slots[index] = Some(Slot::Existing(previous_children[index]));
    }

    let slots = slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| inconsistent(format!("nothing fills new index {index}")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((slots, removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SharingPolicy, TreeConfig};
    use crate::types::NodeState;
    use std::sync::Arc;

    fn sources(n: usize) -> Vec<SourceRef> {
        (0..n).map(SourceRef::new).collect()
    }

    fn kinds(records: &[ChangeRecord]) -> Vec<(ChangeKind, Option<usize>, Option<usize>)> {
        records
            .iter()
            .map(|r| (r.kind, r.old_index, r.new_index))
            .collect()
    }

    fn setup(initial: &[SourceRef]) -> (Registry, NodeId, Vec<NodeId>) {
        let mut registry = Registry::new(SourceRef::new("root"), &TreeConfig::default());
        let root = registry.root();
        let mut effects = Effects::new("tree-test");
        let outcome = reconcile(
            &mut registry,
            &mut effects,
            root,
            initial.to_vec(),
            &IdentityObserver,
        )
        .unwrap();
        (registry, root, outcome.children)
    }

    #[test]
    fn test_diff_rotation() {
        let s = sources(3);
        let (a, b, c) = (s[0].clone(), s[1].clone(), s[2].clone());
        let records = diff(&[a.clone(), b.clone(), c.clone()], &[c, a, b]);

        assert_eq!(
            kinds(&records),
            vec![
                (ChangeKind::Moved, Some(2), Some(0)),
                (ChangeKind::Shifted, Some(0), Some(1)),
                (ChangeKind::Shifted, Some(1), Some(2)),
            ]
        );
    }

    #[test]
    fn test_diff_insert_and_remove() {
        let s = sources(4);
        let previous = vec![s[0].clone(), s[1].clone(), s[2].clone()];
        let current = vec![s[3].clone(), s[0].clone(), s[2].clone()];

        assert_eq!(
            kinds(&diff(&previous, &current)),
            vec![
                (ChangeKind::Removed, Some(1), None),
                (ChangeKind::Added, None, Some(0)),
                (ChangeKind::Shifted, Some(0), Some(1)),
            ]
        );
    }

    #[test]
    fn test_diff_compares_identity_not_value() {
        let previous = vec![SourceRef::new(1)];
        let current = vec![SourceRef::new(1)];
        assert_eq!(
            kinds(&diff(&previous, &current)),
            vec![
                (ChangeKind::Removed, Some(0), None),
                (ChangeKind::Added, None, Some(0)),
            ]
        );
    }

    #[test]
    fn test_longest_increasing() {
        assert_eq!(longest_increasing(&[2, 0, 1]), vec![false, true, true]);
        assert_eq!(longest_increasing(&[]), Vec::<bool>::new());
        assert_eq!(
            longest_increasing(&[0, 3, 1, 2]),
            vec![true, false, true, true]
        );
    }

    #[test]
    fn test_reconcile_preserves_identity() {
        let s = sources(3);
        let (mut registry, root, initial) = setup(&s);

        let mut effects = Effects::new("tree-test");
        let outcome = reconcile(
            &mut registry,
            &mut effects,
            root,
            vec![s[2].clone(), s[0].clone(), s[1].clone()],
            &IdentityObserver,
        )
        .unwrap();

        assert_eq!(outcome.children, vec![initial[2], initial[0], initial[1]]);
        assert_eq!((outcome.added, outcome.removed), (0, 0));
        assert_eq!(outcome.relocated, 3);
        assert!(effects.detached.is_empty());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_reconcile_defers_removal() {
        let s = sources(4);
        let (mut registry, root, initial) = setup(&s[..3]);

        let mut effects = Effects::new("tree-test");
        let outcome = reconcile(
            &mut registry,
            &mut effects,
            root,
            vec![s[2].clone(), s[3].clone()],
            &IdentityObserver,
        )
        .unwrap();

        assert_eq!(outcome.children[0], initial[2]);
        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.added, 1);
        assert_eq!(effects.detached, vec![initial[0], initial[1]]);
        assert_eq!(registry.state(initial[0]).unwrap(), NodeState::Disposed);

        let entry = registry.get(root).unwrap();
        assert_eq!(entry.children.len(), entry.source_children.len());
    }

    #[test]
    fn test_reconcile_to_empty_disposes_all() {
        let s = sources(2);
        let (mut registry, root, initial) = setup(&s);

        let mut effects = Effects::new("tree-test");
        let outcome =
            reconcile(&mut registry, &mut effects, root, Vec::new(), &IdentityObserver).unwrap();

        assert!(outcome.children.is_empty());
        assert_eq!(effects.detached, initial);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reconcile_peer_shared_siblings_share_options() {
        let config = TreeConfig {
            sharing: SharingPolicy::PeerShared,
            ..TreeConfig::default()
        };
        let mut registry = Registry::new(SourceRef::new("root"), &config);
        let root = registry.root();
        let s = sources(3);

        let mut effects = Effects::new("tree-test");
        let first = reconcile(
            &mut registry,
            &mut effects,
            root,
            s[..2].to_vec(),
            &IdentityObserver,
        )
        .unwrap();
        let options =
            |registry: &Registry, id: NodeId| Arc::clone(&registry.get(id).unwrap().options);
        assert!(Arc::ptr_eq(
            &options(&registry, first.children[0]),
            &options(&registry, first.children[1])
        ));
        assert!(!Arc::ptr_eq(
            &options(&registry, first.children[0]),
            &options(&registry, root)
        ));

        // A later arrival joins the surviving peers
        let second = reconcile(&mut registry, &mut effects, root, s.clone(), &IdentityObserver)
            .unwrap();
        assert!(Arc::ptr_eq(
            &options(&registry, second.children[2]),
            &options(&registry, first.children[0])
        ));
        assert_eq!(
            registry
                .update_options(second.children[1], |o| o.lazy = false)
                .unwrap(),
            3
        );
    }

    struct Scrambled;

    impl ChangeObserver for Scrambled {
        fn changes(&self, previous: &[SourceRef], _current: &[SourceRef]) -> Vec<ChangeRecord> {
            vec![ChangeRecord::relocated(
                ChangeKind::Moved,
                0,
                5,
                previous[0].clone(),
            )]
        }
    }

    #[test]
    fn test_inconsistent_records_leave_registry_untouched() {
        let s = sources(3);
        let (mut registry, root, initial) = setup(&s[..2]);

        let mut effects = Effects::new("tree-test");
        let result = reconcile(
            &mut registry,
            &mut effects,
            root,
            vec![s[1].clone(), s[0].clone(), s[2].clone()],
            &Scrambled,
        );

        assert!(matches!(result, Err(TreeError::InconsistentChanges { .. })));
        assert_eq!(registry.get(root).unwrap().children, initial);
        assert_eq!(registry.len(), 3);
    }
}
