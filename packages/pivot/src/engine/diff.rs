//! Leaf/ancestry diff: decides, for every changed leaf, which trailing part
//! of its ancestor chain is new this cycle.

use super::pivot_tree::{ChildKey, PivotTree};
use super::types::{FastHashSet, NodeIdx};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Root-first sibling keys of a leaf. Orders a prefix before its
/// extensions; ties are impossible between distinct leaves but fall back
/// to the node index anyway.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LeafPath {
    pub keys: Vec<ChildKey>,
    pub leaf: NodeIdx,
}

/// Leaves sorted root-first.
pub fn sorted_leaf_paths(tree: &PivotTree, leaves: &[NodeIdx]) -> Vec<LeafPath> {
    let mut paths: Vec<LeafPath> = leaves
        .iter()
        .map(|&leaf| LeafPath {
            keys: tree.sortby_path(leaf),
            leaf,
        })
        .collect();

    #[cfg(feature = "parallel")]
    paths.par_sort_unstable();
    #[cfg(not(feature = "parallel"))]
    paths.sort_unstable();

    paths
}

/// Visited-set bookkeeping for one pass.
#[derive(Debug)]
pub struct AncestryDiff<'a> {
    visited: FastHashSet<NodeIdx>,
    non_zero_ids: &'a FastHashSet<NodeIdx>,
}

impl<'a> AncestryDiff<'a> {
    pub fn new(non_zero_ids: &'a FastHashSet<NodeIdx>) -> Self {
        Self {
            visited: FastHashSet::default(),
            non_zero_ids,
        }
    }

    /// Length of the leading run of `ancestry` (root-first) that needs no
    /// insertion: ancestors not created this cycle, or already handled by
    /// an earlier leaf.
    pub fn existing_prefix(&self, ancestry: &[NodeIdx]) -> usize {
        ancestry
            .iter()
            .take_while(|&&idx| !self.non_zero_ids.contains(&idx) || self.visited.contains(&idx))
            .count()
    }

    pub fn visit(&mut self, ancestry: &[NodeIdx]) {
        self.visited.extend(ancestry.iter().copied());
    }
}

/// Runs the pass over `leaves`, calling `insert(ancestry, num_existed)` once
/// per leaf in root-first order. Returns the number of leaves processed.
pub fn drive(
    tree: &PivotTree,
    leaves: &[NodeIdx],
    non_zero_ids: &FastHashSet<NodeIdx>,
    mut insert: impl FnMut(&[NodeIdx], usize),
) -> usize {
    let paths = sorted_leaf_paths(tree, leaves);
    let mut diff = AncestryDiff::new(non_zero_ids);
    for path in &paths {
        let ancestry = tree.ancestry(path.leaf);
        let num_existed = diff.existing_prefix(&ancestry);
        insert(ancestry.as_slice(), num_existed);
        diff.visit(&ancestry);
    }
    paths.len()
}
