//! Flattened, display-ordered projection of the expanded part of a pivot tree.
//!
//! Rows are kept in pre-order: a node is followed by its visible subtree.
//! The view holds tree indices only and borrows the tree for every
//! operation that needs node data.

use super::pivot_tree::PivotTree;
use super::types::{FastHashSet, FastMap, NodeIdx, PivotPath, ROOT};
use crate::error::{PivotError, Result};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraversalNode {
    pub tree_idx: NodeIdx,
    pub depth: usize,
    pub expanded: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Sibling ordering by an aggregate's value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SortSpec {
    pub aggregate: SmolStr,
    #[serde(default)]
    pub order: SortOrder,
}

impl SortSpec {
    pub fn asc(aggregate: impl Into<SmolStr>) -> Self {
        Self {
            aggregate: aggregate.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(aggregate: impl Into<SmolStr>) -> Self {
        Self {
            aggregate: aggregate.into(),
            order: SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraversalView {
    nodes: Vec<TraversalNode>,
    positions: FastMap<NodeIdx, usize>,
    expand_depth: Option<usize>,
    // (aggregate position, order)
    sorts: Vec<(usize, SortOrder)>,
}

impl TraversalView {
    /// A view showing only the root row. `expand_depth` of `None` expands
    /// every inserted node.
    pub fn new(tree: &PivotTree, expand_depth: Option<usize>, sort: &[SortSpec]) -> Result<Self> {
        let mut view = Self {
            nodes: Vec::new(),
            positions: FastMap::default(),
            expand_depth,
            sorts: resolve_sorts(tree, sort)?,
        };
        view.nodes.push(TraversalNode {
            tree_idx: ROOT,
            depth: 0,
            expanded: view.expands_at(0),
        });
        view.reindex(0);
        Ok(view)
    }

    #[inline]
    fn expands_at(&self, depth: usize) -> bool {
        self.expand_depth.map_or(true, |limit| depth < limit)
    }

    pub fn expand_depth(&self) -> Option<usize> {
        self.expand_depth
    }

    pub fn has_sort(&self) -> bool {
        !self.sorts.is_empty()
    }

    // --- Ordering ---

    /// Sibling order: aggregate sorts first, then grouping key, then index.
    pub fn compare(&self, tree: &PivotTree, a: NodeIdx, b: NodeIdx) -> Ordering {
        let (Some(na), Some(nb)) = (tree.get(a), tree.get(b)) else {
            return a.cmp(&b);
        };
        for &(pos, order) in &self.sorts {
            let ord = na.aggregates.get(pos).cmp(&nb.aggregates.get(pos));
            let ord = match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        (&na.sort_key, &na.value)
            .cmp(&(&nb.sort_key, &nb.value))
            .then(a.cmp(&b))
    }

    fn sorted_children(&self, tree: &PivotTree, parent: NodeIdx) -> Vec<NodeIdx> {
        let mut children: Vec<NodeIdx> = tree.children(parent).collect();
        if !self.sorts.is_empty() {
            children.sort_by(|a, b| self.compare(tree, *a, *b));
        }
        children
    }

    // --- Row bookkeeping ---

    fn reindex(&mut self, from: usize) {
        for (row, node) in self.nodes.iter().enumerate().skip(from) {
            self.positions.insert(node.tree_idx, row);
        }
    }

    fn reindex_all(&mut self) {
        self.positions.clear();
        self.reindex(0);
    }

    /// First row past `row`'s visible subtree.
    pub fn subtree_end(&self, row: usize) -> usize {
        let Some(node) = self.nodes.get(row) else {
            return self.nodes.len();
        };
        self.nodes[row + 1..]
            .iter()
            .position(|n| n.depth <= node.depth)
            .map_or(self.nodes.len(), |offset| row + 1 + offset)
    }

    /// Appends the visible subtree below `parent` to `out`, children in view
    /// order, recursing where `is_expanded` says so.
    fn emit_subtree(
        &self,
        tree: &PivotTree,
        parent: NodeIdx,
        out: &mut Vec<TraversalNode>,
        is_expanded: &dyn Fn(NodeIdx, usize) -> bool,
    ) {
        for child in self.sorted_children(tree, parent) {
            let Some(node) = tree.get(child) else {
                continue;
            };
            let expanded = is_expanded(child, node.depth);
            out.push(TraversalNode {
                tree_idx: child,
                depth: node.depth,
                expanded,
            });
            if expanded {
                self.emit_subtree(tree, child, out, is_expanded);
            }
        }
    }

    /// Re-derives every row below the root from the tree.
    fn rebuild(&mut self, tree: &PivotTree, is_expanded: &dyn Fn(NodeIdx, usize) -> bool) {
        let root = TraversalNode {
            tree_idx: ROOT,
            depth: 0,
            expanded: is_expanded(ROOT, 0),
        };
        let mut nodes = vec![root];
        if root.expanded {
            self.emit_subtree(tree, ROOT, &mut nodes, is_expanded);
        }
        self.nodes = nodes;
        self.reindex_all();
    }

    // --- Incremental patching ---

    /// Fast path for a view that shows only the root: materialize whatever
    /// the tree now holds below it. Returns the added tree indices.
    pub fn populate_root_children(&mut self, tree: &PivotTree) -> Vec<NodeIdx> {
        if !self.nodes.first().is_some_and(|n| n.expanded) {
            return Vec::new();
        }
        let limit = self.expand_depth;
        let mut rows = Vec::new();
        self.emit_subtree(tree, ROOT, &mut rows, &|_, depth| {
            limit.map_or(true, |l| depth < l)
        });
        let added = rows.iter().map(|n| n.tree_idx).collect();
        self.nodes.truncate(1);
        self.nodes.extend(rows);
        self.reindex_all();
        added
    }

    /// Inserts the part of `ancestry` (root-first) past its first
    /// `num_existed` entries. Stops at the first parent that is not visible
    /// or not expanded. Returns the added tree indices.
    pub fn add_node(&mut self, tree: &PivotTree, ancestry: &[NodeIdx], num_existed: usize) -> Vec<NodeIdx> {
        let mut added = Vec::new();
        for i in num_existed.max(1)..ancestry.len() {
            let (parent, node) = (ancestry[i - 1], ancestry[i]);
            if self.positions.contains_key(&node) {
                continue;
            }
            let Some(&prow) = self.positions.get(&parent) else {
                break;
            };
            if !self.nodes[prow].expanded {
                break;
            }
            let Some(depth) = tree.get(node).map(|n| n.depth) else {
                break;
            };
            let row = self.insertion_row(tree, prow, node);
            self.nodes.insert(
                row,
                TraversalNode {
                    tree_idx: node,
                    depth,
                    expanded: self.expands_at(depth),
                },
            );
            self.reindex(row);
            added.push(node);
        }
        added
    }

    fn insertion_row(&self, tree: &PivotTree, prow: usize, node: NodeIdx) -> usize {
        let end = self.subtree_end(prow);
        let mut row = prow + 1;
        while row < end {
            if self.compare(tree, node, self.nodes[row].tree_idx) == Ordering::Less {
                return row;
            }
            row = self.subtree_end(row);
        }
        end
    }

    /// Removes the rows of the given tree nodes together with their visible
    /// subtrees. The root row is never removed. Returns the removed indices.
    pub fn drop_tree_indices(&mut self, indices: &FastHashSet<NodeIdx>) -> Vec<NodeIdx> {
        if indices.is_empty() {
            return Vec::new();
        }
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.nodes.len());
        let mut skip_below: Option<usize> = None;
        for node in self.nodes.drain(..) {
            if let Some(depth) = skip_below {
                if node.depth > depth {
                    removed.push(node.tree_idx);
                    continue;
                }
                skip_below = None;
            }
            if node.tree_idx != ROOT && indices.contains(&node.tree_idx) {
                skip_below = Some(node.depth);
                removed.push(node.tree_idx);
                continue;
            }
            kept.push(node);
        }
        self.nodes = kept;
        if !removed.is_empty() {
            self.reindex_all();
        }
        removed
    }

    /// Re-sorts the visible children of `tree_idx`, moving each child's
    /// subtree along with it.
    pub fn resort_children(&mut self, tree: &PivotTree, tree_idx: NodeIdx) {
        let Some(&prow) = self.positions.get(&tree_idx) else {
            return;
        };
        if !self.nodes[prow].expanded {
            return;
        }
        let end = self.subtree_end(prow);
        let mut chunks: Vec<(usize, usize)> = Vec::new();
        let mut row = prow + 1;
        while row < end {
            let next = self.subtree_end(row);
            chunks.push((row, next));
            row = next;
        }
        if chunks.len() < 2 {
            return;
        }
        chunks.sort_by(|a, b| self.compare(tree, self.nodes[a.0].tree_idx, self.nodes[b.0].tree_idx));
        let reordered: Vec<TraversalNode> = chunks
            .iter()
            .flat_map(|&(start, stop)| self.nodes[start..stop].iter().copied())
            .collect();
        self.nodes.splice(prow + 1..end, reordered);
        self.reindex(prow + 1);
    }

    /// Replaces the sort specification and re-sorts every visible level,
    /// keeping expansion state.
    pub fn sort_by(&mut self, tree: &PivotTree, sort: &[SortSpec]) -> Result<()> {
        self.sorts = resolve_sorts(tree, sort)?;
        let expanded: FastHashSet<NodeIdx> = self.get_expanded().into_iter().collect();
        self.rebuild(tree, &|idx, _| expanded.contains(&idx));
        Ok(())
    }

    // --- Expand / collapse ---

    /// Shows the direct children of the row's node, collapsed. Returns the
    /// number of rows added; out-of-range rows add nothing.
    pub fn expand(&mut self, tree: &PivotTree, row: usize) -> usize {
        match self.nodes.get(row) {
            Some(node) if !node.expanded => {}
            _ => return 0,
        }
        let tree_idx = self.nodes[row].tree_idx;
        let mut children = Vec::new();
        self.emit_subtree(tree, tree_idx, &mut children, &|_, _| false);
        let count = children.len();
        self.nodes[row].expanded = true;
        self.nodes.splice(row + 1..row + 1, children);
        self.reindex(row + 1);
        count
    }

    /// Hides the row's visible subtree. Returns the number of rows removed.
    pub fn collapse(&mut self, row: usize) -> usize {
        match self.nodes.get(row) {
            Some(node) if node.expanded => {}
            _ => return 0,
        }
        let end = self.subtree_end(row);
        for node in self.nodes.drain(row + 1..end) {
            self.positions.remove(&node.tree_idx);
        }
        self.nodes[row].expanded = false;
        self.reindex(row + 1);
        end - row - 1
    }

    /// Expands every node shallower than `depth` and collapses the rest.
    /// Also becomes the expansion rule for nodes inserted later.
    pub fn set_depth(&mut self, tree: &PivotTree, depth: usize) {
        self.expand_depth = Some(depth);
        self.rebuild(tree, &|_, d| d < depth);
    }

    /// Expands exactly the given nodes, as far as they are reachable.
    pub fn set_expanded(&mut self, tree: &PivotTree, expanded: &FastHashSet<NodeIdx>) {
        self.rebuild(tree, &|idx, _| expanded.contains(&idx));
    }

    // --- Queries ---

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[TraversalNode] {
        &self.nodes
    }

    pub fn get_node(&self, row: usize) -> Option<&TraversalNode> {
        self.nodes.get(row)
    }

    pub fn get_tree_index(&self, row: usize) -> Option<NodeIdx> {
        self.nodes.get(row).map(|n| n.tree_idx)
    }

    /// Row showing `tree_idx`; `hint` is checked first.
    pub fn tree_index_lookup(&self, tree_idx: NodeIdx, hint: usize) -> Option<usize> {
        if self.nodes.get(hint).is_some_and(|n| n.tree_idx == tree_idx) {
            return Some(hint);
        }
        self.positions.get(&tree_idx).copied()
    }

    /// Rows of the row's visible ancestors, root first, ending at `row`.
    pub fn ancestry(&self, row: usize) -> Vec<usize> {
        let Some(node) = self.nodes.get(row) else {
            return Vec::new();
        };
        let mut rows = vec![row];
        let mut depth = node.depth;
        for r in (0..row).rev() {
            if depth == 0 {
                break;
            }
            if self.nodes[r].depth < depth {
                depth = self.nodes[r].depth;
                rows.push(r);
            }
        }
        rows.reverse();
        rows
    }

    /// Pivot path of the row's node; empty for out-of-range rows.
    pub fn path(&self, tree: &PivotTree, row: usize) -> PivotPath {
        self.get_tree_index(row)
            .map(|idx| tree.path(idx))
            .unwrap_or_default()
    }

    pub fn is_expanded(&self, tree_idx: NodeIdx) -> bool {
        self.positions
            .get(&tree_idx)
            .is_some_and(|&row| self.nodes[row].expanded)
    }

    /// Tree indices of expanded rows, in row order.
    pub fn get_expanded(&self) -> Vec<NodeIdx> {
        self.nodes
            .iter()
            .filter(|n| n.expanded)
            .map(|n| n.tree_idx)
            .collect()
    }

    /// The row and its visible subtree, clipped to `stop_depth`.
    pub fn get_flattened_tree(&self, row: usize, stop_depth: Option<usize>) -> Vec<TraversalNode> {
        if row >= self.nodes.len() {
            return Vec::new();
        }
        let end = self.subtree_end(row);
        self.nodes[row..end]
            .iter()
            .filter(|n| stop_depth.map_or(true, |d| n.depth <= d))
            .copied()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraversalNode> {
        self.nodes.iter()
    }
}

fn resolve_sorts(tree: &PivotTree, sort: &[SortSpec]) -> Result<Vec<(usize, SortOrder)>> {
    sort.iter()
        .map(|spec| {
            tree.agg_position(&spec.aggregate)
                .map(|pos| (pos, spec.order))
                .ok_or_else(|| PivotError::Config(format!("sort references unknown aggregate `{}`", spec.aggregate)))
        })
        .collect()
}
