//! Per-cycle display output.
//!
//! A cycle reports which tree nodes entered, left or changed within the
//! traversal view. Consumers that prefer snapshots can flatten the view and
//! compare fingerprints instead.

use super::pivot_tree::PivotTree;
use super::traversal::TraversalView;
use super::types::{NodeIdx, PivotPath, Scalar};
use serde::{Deserialize, Serialize};

/// Visible-row changes produced by one cycle, as tree indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewDelta {
    /// Nodes that became visible
    pub additions: Vec<NodeIdx>,
    /// Nodes whose rows were dropped
    pub removals: Vec<NodeIdx>,
    /// Visible nodes whose aggregates changed
    pub updates: Vec<NodeIdx>,
}

impl ViewDelta {
    #[inline]
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty() && self.updates.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.additions.len() + self.removals.len() + self.updates.len()
    }
}

/// One rendered view row.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FlatRow {
    pub path: PivotPath,
    pub depth: usize,
    pub expanded: bool,
    pub aggregates: Vec<Scalar>,
}

pub fn flat_rows(view: &TraversalView, tree: &PivotTree) -> Vec<FlatRow> {
    view.iter()
        .map(|row| FlatRow {
            path: tree.path(row.tree_idx),
            depth: row.depth,
            expanded: row.expanded,
            aggregates: tree.aggregates(row.tree_idx).map(<[Scalar]>::to_vec).unwrap_or_default(),
        })
        .collect()
}

/// Fingerprint of everything a renderer would show: row order, depth,
/// expansion, path and aggregate values. Node indices are not part of it.
pub fn compute_view_hash(view: &TraversalView, tree: &PivotTree) -> String {
    let mut hasher = blake3::Hasher::new();
    for row in view.iter() {
        hasher.update(&(row.depth as u64).to_be_bytes());
        hasher.update(&[row.expanded as u8]);
        if let Some(node) = tree.get(row.tree_idx) {
            // path segments are implied by row order and depth
            node.value.hash_into(&mut hasher);
            hasher.update(&(node.aggregates.len() as u64).to_be_bytes());
            for value in &node.aggregates {
                value.hash_into(&mut hasher);
            }
        }
        hasher.update(&[0]); // delimiter
    }
    hasher.finalize().to_hex().to_string()
}
