//! One cycle of sparse-tree maintenance: strand table in, patched pivot
//! tree and traversal view out.

use super::aggregate::Aggregator;
use super::delta_tree::DeltaTree;
use super::diff;
use super::pivot_tree::PivotTree;
use super::store::Snapshot;
use super::strand::StrandTable;
use super::traversal::TraversalView;
use super::types::{FastHashSet, NodeIdx};
use super::update::ViewDelta;
use crate::error::Result;
use tracing::{debug, instrument};

/// Merges `strands` into `tree` and patches `view` when one is maintained.
///
/// Aggregates are folded before the tree is touched, so a reducer failure
/// returns with tree and view unchanged.
///
/// Without a view there are no display rows to compare, so any structural
/// or aggregate change sets the tree's pending-display flag.
#[instrument(level = "debug", skip_all, fields(strands = strands.len()))]
pub fn notify_sparse_tree(
    strands: &StrandTable,
    tree: &mut PivotTree,
    mut view: Option<&mut TraversalView>,
    aggregator: &dyn Aggregator,
    snapshot: &dyn Snapshot,
) -> Result<ViewDelta> {
    let dtree = DeltaTree::build(strands, tree.npivots(), tree.specs().len())?;
    let plan = tree.plan_aggregates(&dtree, aggregator, snapshot)?;

    tree.update_shape(&dtree)?;
    let zero = tree.zero_strands();

    let mut delta = ViewDelta::empty();
    if let Some(view) = view.as_deref_mut() {
        let before = view.len();
        delta.removals = view.drop_tree_indices(&zero);
        if view.len() != before {
            tree.set_has_deltas(true);
        }
    }

    let non_zero_ids = tree.non_zero_ids(&zero);
    let leaves = tree.non_zero_leaves(&dtree, &zero);
    tree.drop_zero_strands(&zero);
    tree.populate_leaf_index(&leaves);
    let changed = tree.commit_aggregates(plan, &zero);

    match view {
        Some(view) => {
            resort_affected(tree, view, &changed);
            delta.additions = insert_new_rows(tree, view, &leaves, &non_zero_ids);
            delta.updates = changed
                .into_iter()
                .filter(|&idx| !tree.is_new(idx) && view.tree_index_lookup(idx, 0).is_some())
                .collect();
            if !delta.additions.is_empty() || !delta.updates.is_empty() {
                tree.set_has_deltas(true);
            }
        }
        None => {
            if !zero.is_empty() || !non_zero_ids.is_empty() || !changed.is_empty() {
                tree.set_has_deltas(true);
            }
        }
    }

    tree.end_cycle();
    debug!(
        added = delta.additions.len(),
        removed = delta.removals.len(),
        updated = delta.updates.len(),
        nodes = tree.len(),
        "sparse tree notified"
    );
    Ok(delta)
}

fn insert_new_rows(
    tree: &PivotTree,
    view: &mut TraversalView,
    leaves: &[NodeIdx],
    non_zero_ids: &FastHashSet<NodeIdx>,
) -> Vec<NodeIdx> {
    if leaves.is_empty() {
        return Vec::new();
    }
    if view.len() == 1 {
        return view.populate_root_children(tree);
    }
    let mut added = Vec::new();
    diff::drive(tree, leaves, non_zero_ids, |ancestry, num_existed| {
        added.extend(view.add_node(tree, ancestry, num_existed));
    });
    added
}

/// Restores sibling order where it may have moved: parents whose children
/// were re-keyed, and with an aggregate sort active, parents of nodes whose
/// aggregates changed. Runs before insertion so new rows land among
/// correctly ordered siblings.
fn resort_affected(tree: &PivotTree, view: &mut TraversalView, changed: &[NodeIdx]) {
    let mut parents: Vec<NodeIdx> = tree.rekeyed_parents().collect();
    if view.has_sort() {
        parents.extend(
            changed
                .iter()
                .filter(|&&idx| !tree.is_new(idx))
                .filter_map(|&idx| tree.get(idx).and_then(|n| n.parent)),
        );
    }
    parents.sort_unstable();
    parents.dedup();
    for parent in parents {
        view.resort_children(tree, parent);
    }
}
