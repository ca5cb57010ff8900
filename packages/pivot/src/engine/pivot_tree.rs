//! Persistent group-by tree.
//!
//! Nodes live in an index-addressed arena. A node's index is stable for its
//! lifetime and is recycled through a free list once the node is pruned.

use super::aggregate::{AggSpec, Aggregator};
use super::delta_tree::DeltaTree;
use super::store::Snapshot;
use super::types::{FastHashSet, FastMap, NodeIdx, PivotPath, Scalar, ROOT};
use crate::error::{PivotError, Result};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Root-first node chain; inline for trees up to eight levels deep.
pub type Ancestry = SmallVec<[NodeIdx; 8]>;

/// Position of a node among its siblings: grouping sort key, then value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChildKey {
    pub sort_key: Scalar,
    pub value: Scalar,
}

#[derive(Clone, Debug)]
pub struct PivotTreeNode {
    pub idx: NodeIdx,
    pub value: Scalar,
    pub sort_key: Scalar,
    pub depth: usize,
    pub parent: Option<NodeIdx>,
    pub children: BTreeMap<ChildKey, NodeIdx>,
    pub aggregates: Vec<Scalar>,
    /// Contributing rows in this node's subtree.
    pub nstrands: i64,
}

impl PivotTreeNode {
    pub fn key(&self) -> ChildKey {
        ChildKey {
            sort_key: self.sort_key.clone(),
            value: self.value.clone(),
        }
    }

    #[inline]
    pub fn is_zero_strand(&self) -> bool {
        self.nstrands <= 0
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Folded aggregate values for every delta tree node, computed before the
/// tree is touched so a failing reducer leaves nothing half-applied.
#[derive(Debug, Clone, Default)]
pub struct AggregatePlan {
    values: Vec<Vec<Scalar>>,
}

#[derive(Debug)]
pub struct PivotTree {
    nodes: Vec<Option<PivotTreeNode>>,
    free: Vec<NodeIdx>,
    child_index: FastMap<(NodeIdx, Scalar), NodeIdx>,
    npivots: usize,
    specs: Vec<AggSpec>,
    initial_aggs: Vec<Scalar>,
    // per-cycle bookkeeping
    new_ids: FastHashSet<NodeIdx>,
    delta_map: Vec<NodeIdx>,
    rekeyed_parents: FastHashSet<NodeIdx>,
    leaf_index: FastMap<PivotPath, NodeIdx>,
    has_deltas: bool,
    len: usize,
}

impl PivotTree {
    pub fn new(npivots: usize, specs: Vec<AggSpec>, aggregator: &dyn Aggregator) -> Self {
        let initial_aggs: Vec<Scalar> = specs.iter().map(|s| aggregator.initial(s)).collect();
        let root = PivotTreeNode {
            idx: ROOT,
            value: Scalar::Null,
            sort_key: Scalar::Null,
            depth: 0,
            parent: None,
            children: BTreeMap::new(),
            aggregates: initial_aggs.clone(),
            nstrands: 0,
        };
        Self {
            nodes: vec![Some(root)],
            free: Vec::new(),
            child_index: FastMap::default(),
            npivots,
            specs,
            initial_aggs,
            new_ids: FastHashSet::default(),
            delta_map: Vec::new(),
            rekeyed_parents: FastHashSet::default(),
            leaf_index: FastMap::default(),
            has_deltas: false,
            len: 1,
        }
    }

    // --- Merge steps, in cycle order ---

    /// Folds every delta node's contributions into the prior aggregates of
    /// the pivot node at the same path. Read-only.
    pub fn plan_aggregates(
        &self,
        dtree: &DeltaTree,
        aggregator: &dyn Aggregator,
        snapshot: &dyn Snapshot,
    ) -> Result<AggregatePlan> {
        let mut existing: Vec<Option<NodeIdx>> = vec![None; dtree.len()];
        let mut values = vec![Vec::new(); dtree.len()];
        for didx in dtree.preorder() {
            let dnode = dtree.node(didx);
            let pidx = match dnode.parent {
                None => Some(ROOT),
                Some(dparent) => existing[dparent].and_then(|p| self.lookup_child(p, &dnode.value)),
            };
            existing[didx] = pidx;

            let prior = pidx
                .and_then(|p| self.get(p))
                .map(|n| n.aggregates.as_slice())
                .unwrap_or(self.initial_aggs.as_slice());
            let mut folded = Vec::with_capacity(self.specs.len());
            for ((spec, prior), delta) in self.specs.iter().zip(prior).zip(&dnode.aggs) {
                folded.push(aggregator.fold(spec, prior, delta, snapshot)?);
            }
            values[didx] = folded;
        }
        Ok(AggregatePlan { values })
    }

    /// Creates missing nodes, applies row-count changes and re-keys siblings
    /// whose grouping sort key moved.
    pub fn update_shape(&mut self, dtree: &DeltaTree) -> Result<()> {
        if dtree.levels() != self.npivots + 1 {
            return Err(PivotError::PivotArity {
                expected: self.npivots,
                got: dtree.levels().saturating_sub(1),
            });
        }
        self.new_ids.clear();
        self.rekeyed_parents.clear();
        self.delta_map = vec![ROOT; dtree.len()];

        for didx in dtree.preorder() {
            let dnode = dtree.node(didx);
            let pidx = match dnode.parent {
                None => ROOT,
                Some(dparent) => {
                    let parent = self.delta_map[dparent];
                    match self.lookup_child(parent, &dnode.value) {
                        Some(existing) => {
                            if let Some(key) = &dnode.sort_key {
                                self.rekey(existing, key)?;
                            }
                            existing
                        }
                        None => {
                            let sort_key = dnode.sort_key.clone().unwrap_or_else(|| dnode.value.clone());
                            self.insert_node(parent, dnode.value.clone(), sort_key)?
                        }
                    }
                }
            };
            self.delta_map[didx] = pidx;
            self.node_mut(pidx)?.nstrands += dnode.nstrands;
        }

        trace!(created = self.new_ids.len(), nodes = self.len, "tree shape updated");
        Ok(())
    }

    fn insert_node(&mut self, parent: NodeIdx, value: Scalar, sort_key: Scalar) -> Result<NodeIdx> {
        let depth = self.node(parent)?.depth + 1;
        let idx = self.free.pop().unwrap_or(self.nodes.len());
        let node = PivotTreeNode {
            idx,
            value: value.clone(),
            sort_key,
            depth,
            parent: Some(parent),
            children: BTreeMap::new(),
            aggregates: self.initial_aggs.clone(),
            nstrands: 0,
        };
        let key = node.key();
        if idx == self.nodes.len() {
            self.nodes.push(Some(node));
        } else {
            self.nodes[idx] = Some(node);
        }
        self.node_mut(parent)?.children.insert(key, idx);
        self.child_index.insert((parent, value), idx);
        self.new_ids.insert(idx);
        self.len += 1;
        Ok(idx)
    }

    fn rekey(&mut self, idx: NodeIdx, sort_key: &Scalar) -> Result<()> {
        let node = self.node(idx)?;
        if &node.sort_key == sort_key {
            return Ok(());
        }
        let old = node.key();
        let parent = node.parent.ok_or(PivotError::UnknownNode(idx))?;
        self.node_mut(idx)?.sort_key = sort_key.clone();
        let new = self.node(idx)?.key();
        let siblings = &mut self.node_mut(parent)?.children;
        siblings.remove(&old);
        siblings.insert(new, idx);
        self.rekeyed_parents.insert(parent);
        Ok(())
    }

    /// Nodes touched this cycle that no longer have contributing rows, with
    /// their descendants. The root is never included.
    pub fn zero_strands(&self) -> FastHashSet<NodeIdx> {
        let mut zero = FastHashSet::default();
        for &idx in &self.delta_map {
            if idx == ROOT || zero.contains(&idx) {
                continue;
            }
            if self.get(idx).is_some_and(|n| n.is_zero_strand()) {
                let mut stack = vec![idx];
                while let Some(cur) = stack.pop() {
                    if zero.insert(cur) {
                        stack.extend(self.children(cur));
                    }
                }
            }
        }
        zero
    }

    /// Nodes created this cycle that survive pruning.
    pub fn non_zero_ids(&self, zero: &FastHashSet<NodeIdx>) -> FastHashSet<NodeIdx> {
        self.new_ids.difference(zero).copied().collect()
    }

    /// Surviving pivot nodes where this cycle's strand rows end.
    pub fn non_zero_leaves(&self, dtree: &DeltaTree, zero: &FastHashSet<NodeIdx>) -> Vec<NodeIdx> {
        dtree
            .terminals()
            .filter_map(|didx| self.delta_map.get(didx).copied())
            .filter(|idx| *idx != ROOT && !zero.contains(idx))
            .collect()
    }

    pub fn drop_zero_strands(&mut self, zero: &FastHashSet<NodeIdx>) {
        for &idx in zero {
            if idx == ROOT {
                continue;
            }
            let Some(node) = self.nodes.get_mut(idx).and_then(Option::take) else {
                continue;
            };
            if let Some(parent) = node.parent {
                if let Some(Some(p)) = self.nodes.get_mut(parent) {
                    p.children.remove(&node.key());
                }
                self.child_index.remove(&(parent, node.value.clone()));
            }
            self.new_ids.remove(&idx);
            self.rekeyed_parents.remove(&idx);
            self.free.push(idx);
            self.len -= 1;
        }
        self.leaf_index.retain(|_, idx| !zero.contains(idx));
        if !zero.is_empty() {
            debug!(pruned = zero.len(), nodes = self.len, "zero-strand nodes dropped");
        }
    }

    pub fn populate_leaf_index(&mut self, leaves: &[NodeIdx]) {
        for &leaf in leaves {
            let path = self.path(leaf);
            self.leaf_index.insert(path, leaf);
        }
    }

    /// Writes planned aggregates onto surviving nodes and returns the nodes
    /// whose values changed.
    pub fn commit_aggregates(&mut self, plan: AggregatePlan, zero: &FastHashSet<NodeIdx>) -> Vec<NodeIdx> {
        let mut changed = Vec::new();
        for (didx, values) in plan.values.into_iter().enumerate() {
            let Some(&idx) = self.delta_map.get(didx) else {
                continue;
            };
            if zero.contains(&idx) {
                continue;
            }
            if let Some(Some(node)) = self.nodes.get_mut(idx) {
                if node.aggregates != values {
                    node.aggregates = values;
                    changed.push(idx);
                }
            }
        }
        changed
    }

    /// Parents whose child order changed through a sort-key move this cycle.
    pub fn rekeyed_parents(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.rekeyed_parents.iter().copied()
    }

    pub fn is_new(&self, idx: NodeIdx) -> bool {
        self.new_ids.contains(&idx)
    }

    pub fn end_cycle(&mut self) {
        self.new_ids.clear();
        self.delta_map.clear();
        self.rekeyed_parents.clear();
    }

    // --- Pending display deltas ---

    pub fn has_deltas(&self) -> bool {
        self.has_deltas
    }

    pub fn set_has_deltas(&mut self, value: bool) {
        self.has_deltas = value;
    }

    pub fn take_has_deltas(&mut self) -> bool {
        std::mem::take(&mut self.has_deltas)
    }

    // --- Queries ---

    #[inline]
    pub fn get(&self, idx: NodeIdx) -> Option<&PivotTreeNode> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    pub fn node(&self, idx: NodeIdx) -> Result<&PivotTreeNode> {
        self.get(idx).ok_or(PivotError::UnknownNode(idx))
    }

    fn node_mut(&mut self, idx: NodeIdx) -> Result<&mut PivotTreeNode> {
        self.nodes
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or(PivotError::UnknownNode(idx))
    }

    pub fn contains(&self, idx: NodeIdx) -> bool {
        self.get(idx).is_some()
    }

    #[inline]
    fn lookup_child(&self, parent: NodeIdx, value: &Scalar) -> Option<NodeIdx> {
        self.child_index.get(&(parent, value.clone())).copied()
    }

    /// Children in grouping order.
    pub fn children(&self, idx: NodeIdx) -> impl Iterator<Item = NodeIdx> + '_ {
        self.get(idx)
            .into_iter()
            .flat_map(|n| n.children.values().copied())
    }

    /// Root-first chain of node indices ending at `idx`, root included.
    pub fn ancestry(&self, idx: NodeIdx) -> Ancestry {
        let mut chain = Ancestry::new();
        let mut cur = self.get(idx);
        while let Some(node) = cur {
            chain.push(node.idx);
            cur = node.parent.and_then(|p| self.get(p));
        }
        chain.reverse();
        chain
    }

    pub fn path(&self, idx: NodeIdx) -> PivotPath {
        PivotPath(
            self.ancestry(idx)
                .into_iter()
                .skip(1)
                .filter_map(|i| self.get(i).map(|n| n.value.clone()))
                .collect(),
        )
    }

    /// Root-first sibling keys, the total order the diff pass sorts leaves by.
    pub fn sortby_path(&self, idx: NodeIdx) -> Vec<ChildKey> {
        self.ancestry(idx)
            .into_iter()
            .skip(1)
            .filter_map(|i| self.get(i).map(PivotTreeNode::key))
            .collect()
    }

    pub fn find(&self, path: &PivotPath) -> Option<NodeIdx> {
        if let Some(&idx) = self.leaf_index.get(path) {
            return Some(idx);
        }
        path.segments()
            .iter()
            .try_fold(ROOT, |cur, value| self.lookup_child(cur, value))
    }

    pub fn aggregates(&self, idx: NodeIdx) -> Option<&[Scalar]> {
        self.get(idx).map(|n| n.aggregates.as_slice())
    }

    pub fn aggregate(&self, idx: NodeIdx, name: &str) -> Option<&Scalar> {
        let pos = self.agg_position(name)?;
        self.get(idx).and_then(|n| n.aggregates.get(pos))
    }

    pub fn agg_position(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.name == name)
    }

    pub fn specs(&self) -> &[AggSpec] {
        &self.specs
    }

    pub fn npivots(&self) -> usize {
        self.npivots
    }

    /// Live node count, root included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Only the root is left.
    pub fn is_empty(&self) -> bool {
        self.len == 1
    }

    pub fn iter(&self) -> impl Iterator<Item = &PivotTreeNode> {
        self.nodes.iter().filter_map(Option::as_ref)
    }
}

#[cfg(test)]
mod pivot_tree_tests {
    use super::*;
    use crate::engine::aggregate::{AggDelta, StandardAggregator};
    use crate::engine::store::RowStore;
    use crate::engine::strand::{StrandDeltaRow, StrandRow, StrandTable};

    fn strand(path: &[&str], n: i64, value: f64) -> (StrandRow, StrandDeltaRow) {
        let path: PivotPath = path.iter().copied().collect();
        let agg = if n >= 0 {
            AggDelta {
                asserted: vec![Scalar::from(value); n as usize],
                retracted: vec![],
            }
        } else {
            AggDelta {
                asserted: vec![],
                retracted: vec![Scalar::from(value); (-n) as usize],
            }
        };
        (
            StrandRow {
                path: path.clone(),
                sort_keys: vec![],
                nstrands: n,
            },
            StrandDeltaRow { path, aggs: vec![agg] },
        )
    }

    fn table(rows: Vec<(StrandRow, StrandDeltaRow)>) -> StrandTable {
        let (rows, deltas) = rows.into_iter().unzip();
        StrandTable { rows, deltas }
    }

    fn apply(tree: &mut PivotTree, strands: StrandTable) -> FastHashSet<NodeIdx> {
        let dtree = DeltaTree::build(&strands, tree.npivots(), tree.specs().len()).unwrap();
        let plan = tree
            .plan_aggregates(&dtree, &StandardAggregator, &RowStore::new())
            .unwrap();
        tree.update_shape(&dtree).unwrap();
        let zero = tree.zero_strands();
        tree.drop_zero_strands(&zero);
        tree.commit_aggregates(plan, &zero);
        let leaves = tree.non_zero_leaves(&dtree, &zero);
        tree.populate_leaf_index(&leaves);
        tree.end_cycle();
        zero
    }

    fn new_tree() -> PivotTree {
        PivotTree::new(2, vec![AggSpec::sum("count", "count")], &StandardAggregator)
    }

    fn path(values: &[&str]) -> PivotPath {
        values.iter().copied().collect()
    }

    #[test]
    fn test_merge_creates_prefix_chain() {
        let mut tree = new_tree();
        apply(&mut tree, table(vec![strand(&["EU"], 1, 5.0), strand(&["EU", "DE"], 1, 5.0)]));
        assert_eq!(tree.len(), 3);
        let eu = tree.find(&path(&["EU"])).unwrap();
        let de = tree.find(&path(&["EU", "DE"])).unwrap();
        assert_eq!(tree.aggregate(eu, "count"), Some(&Scalar::from(10.0)));
        assert_eq!(tree.aggregate(de, "count"), Some(&Scalar::from(5.0)));
        assert_eq!(tree.aggregate(ROOT, "count"), Some(&Scalar::from(10.0)));
        assert_eq!(tree.ancestry(de).as_slice(), &[ROOT, eu, de]);
        assert_eq!(tree.path(de), path(&["EU", "DE"]));
        assert_eq!(tree.get(de).unwrap().parent, Some(eu));
    }

    #[test]
    fn test_zero_strand_pruned_and_recycled() {
        let mut tree = new_tree();
        apply(&mut tree, table(vec![strand(&["EU"], 1, 5.0), strand(&["EU", "DE"], 1, 5.0)]));
        let de = tree.find(&path(&["EU", "DE"])).unwrap();

        let zero = apply(&mut tree, table(vec![strand(&["EU", "DE"], -1, 5.0)]));
        assert!(zero.contains(&de));
        assert_eq!(tree.len(), 2);
        assert!(tree.find(&path(&["EU", "DE"])).is_none());
        let eu = tree.find(&path(&["EU"])).unwrap();
        assert_eq!(tree.aggregate(eu, "count"), Some(&Scalar::from(5.0)));
        assert_eq!(tree.children(eu).count(), 0);

        apply(&mut tree, table(vec![strand(&["US"], 1, 1.0)]));
        assert_eq!(tree.find(&path(&["US"])), Some(de));
    }

    #[test]
    fn test_pruning_takes_descendants() {
        let mut tree = new_tree();
        apply(&mut tree, table(vec![strand(&["EU", "DE"], 1, 5.0)]));
        let zero = apply(&mut tree, table(vec![strand(&["EU", "DE"], -1, 5.0)]));
        assert_eq!(zero.len(), 2);
        assert!(tree.is_empty());
        assert_eq!(tree.aggregate(ROOT, "count"), Some(&Scalar::from(0.0)));
    }

    #[test]
    fn test_non_zero_ids_are_new_survivors() {
        let mut tree = new_tree();
        apply(&mut tree, table(vec![strand(&["EU"], 1, 5.0)]));
        let strands = table(vec![strand(&["EU", "DE"], 1, 1.0), strand(&["US"], 1, 1.0)]);
        let dtree = DeltaTree::build(&strands, 2, 1).unwrap();
        tree.update_shape(&dtree).unwrap();
        let zero = tree.zero_strands();
        let ids = tree.non_zero_ids(&zero);
        let eu = tree.find(&path(&["EU"])).unwrap();
        assert!(!ids.contains(&eu));
        assert_eq!(ids.len(), 2);
        assert_eq!(tree.non_zero_leaves(&dtree, &zero).len(), 2);
    }

    #[test]
    fn test_failed_plan_leaves_tree_untouched() {
        let mut tree = new_tree();
        apply(&mut tree, table(vec![strand(&["EU"], 1, 5.0)]));
        let (row, mut delta) = strand(&["US"], 1, 0.0);
        delta.aggs[0].asserted = vec![Scalar::from("oops")];
        let dtree = DeltaTree::build(&table(vec![(row, delta)]), 2, 1).unwrap();
        let err = tree
            .plan_aggregates(&dtree, &StandardAggregator, &RowStore::new())
            .unwrap_err();
        assert!(matches!(err, PivotError::Aggregate { .. }));
        assert_eq!(tree.len(), 2);
        assert!(tree.find(&path(&["US"])).is_none());
    }

    #[test]
    fn test_sort_key_rekeys_siblings() {
        let mut tree = new_tree();
        let mut a = strand(&["A"], 1, 1.0);
        a.0.sort_keys = vec![Scalar::from(2.0)];
        let mut b = strand(&["B"], 1, 1.0);
        b.0.sort_keys = vec![Scalar::from(1.0)];
        apply(&mut tree, table(vec![a, b]));
        let order: Vec<PivotPath> = tree.children(ROOT).map(|i| tree.path(i)).collect();
        assert_eq!(order, vec![path(&["B"]), path(&["A"])]);

        let mut a2 = strand(&["A"], 0, 0.0);
        a2.0.sort_keys = vec![Scalar::from(0.0)];
        let dtree = DeltaTree::build(&table(vec![a2]), 2, 1).unwrap();
        tree.update_shape(&dtree).unwrap();
        assert_eq!(tree.rekeyed_parents().collect::<Vec<_>>(), vec![ROOT]);
        let order: Vec<PivotPath> = tree.children(ROOT).map(|i| tree.path(i)).collect();
        assert_eq!(order, vec![path(&["A"]), path(&["B"])]);
    }

    #[test]
    fn test_has_deltas_take() {
        let mut tree = new_tree();
        tree.set_has_deltas(true);
        assert!(tree.take_has_deltas());
        assert!(!tree.has_deltas());
    }
}
