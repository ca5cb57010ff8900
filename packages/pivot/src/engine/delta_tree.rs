//! Per-cycle grouping tree built from a strand table.
//!
//! The delta tree mirrors the shape implied by one batch only. It never
//! reads the persistent pivot tree; the merge step maps its nodes onto
//! pivot tree nodes afterwards.

use super::aggregate::AggDelta;
use super::strand::StrandTable;
use super::types::{PivotPath, Scalar};
use crate::error::{PivotError, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct DeltaTreeNode {
    pub value: Scalar,
    /// Grouping sort key reported for this level, if any row image carried one.
    pub sort_key: Option<Scalar>,
    pub depth: usize,
    pub parent: Option<usize>,
    pub children: BTreeMap<Scalar, usize>,
    /// Net contributing-row change for the whole subtree.
    pub nstrands: i64,
    /// Subtree contributions per aggregate.
    pub aggs: Vec<AggDelta>,
    /// A strand row ends exactly here.
    pub terminal: bool,
}

#[derive(Debug, Clone)]
pub struct DeltaTree {
    nodes: Vec<DeltaTreeNode>,
    levels: usize,
}

impl DeltaTree {
    pub const ROOT: usize = 0;

    /// Builds the tree for one batch. `levels` is `npivots + 1`, the extra
    /// level being the root sentinel.
    pub fn build(strands: &StrandTable, npivots: usize, naggs: usize) -> Result<Self> {
        if strands.rows.len() != strands.deltas.len() {
            return Err(PivotError::StrandMismatch(format!(
                "{} strand rows but {} delta rows",
                strands.rows.len(),
                strands.deltas.len()
            )));
        }

        let mut tree = DeltaTree {
            nodes: vec![DeltaTreeNode {
                value: Scalar::Null,
                sort_key: None,
                depth: 0,
                parent: None,
                children: BTreeMap::new(),
                nstrands: 0,
                aggs: vec![AggDelta::default(); naggs],
                terminal: false,
            }],
            levels: npivots + 1,
        };

        for (row, delta) in strands.iter() {
            let path = row.path.segments();
            if path.len() > npivots {
                return Err(PivotError::PivotArity {
                    expected: npivots,
                    got: path.len(),
                });
            }
            if row.path != delta.path {
                return Err(PivotError::StrandMismatch(format!(
                    "row path `{}` paired with delta path `{}`",
                    row.path, delta.path
                )));
            }
            if delta.aggs.len() != naggs {
                return Err(PivotError::StrandMismatch(format!(
                    "path `{}` carries {} aggregate deltas, expected {naggs}",
                    row.path,
                    delta.aggs.len()
                )));
            }
            if !row.sort_keys.is_empty() && row.sort_keys.len() != path.len() {
                return Err(PivotError::StrandMismatch(format!(
                    "path `{}` has {} sort keys",
                    row.path,
                    row.sort_keys.len()
                )));
            }

            let mut cur = Self::ROOT;
            tree.absorb(cur, row.nstrands, &delta.aggs);
            for (depth, value) in path.iter().enumerate() {
                cur = tree.child_or_insert(cur, value, naggs);
                if let Some(key) = row.sort_keys.get(depth) {
                    tree.nodes[cur].sort_key = Some(key.clone());
                }
                tree.absorb(cur, row.nstrands, &delta.aggs);
            }
            tree.nodes[cur].terminal = true;
        }

        Ok(tree)
    }

    fn child_or_insert(&mut self, parent: usize, value: &Scalar, naggs: usize) -> usize {
        if let Some(&idx) = self.nodes[parent].children.get(value) {
            return idx;
        }
        let idx = self.nodes.len();
        let depth = self.nodes[parent].depth + 1;
        self.nodes.push(DeltaTreeNode {
            value: value.clone(),
            sort_key: None,
            depth,
            parent: Some(parent),
            children: BTreeMap::new(),
            nstrands: 0,
            aggs: vec![AggDelta::default(); naggs],
            terminal: false,
        });
        self.nodes[parent].children.insert(value.clone(), idx);
        idx
    }

    fn absorb(&mut self, idx: usize, nstrands: i64, aggs: &[AggDelta]) {
        let node = &mut self.nodes[idx];
        node.nstrands += nstrands;
        for (acc, delta) in node.aggs.iter_mut().zip(aggs) {
            acc.merge(delta);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Only the root sentinel exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn node(&self, idx: usize) -> &DeltaTreeNode {
        &self.nodes[idx]
    }

    /// Parents before children, siblings by value.
    pub fn preorder(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![Self::ROOT];
        while let Some(idx) = stack.pop() {
            out.push(idx);
            stack.extend(self.nodes[idx].children.values().rev().copied());
        }
        out
    }

    /// Nodes where a strand row ends, excluding the root.
    pub fn terminals(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, n)| n.terminal)
            .map(|(i, _)| i)
    }

    pub fn path(&self, mut idx: usize) -> PivotPath {
        let mut values = Vec::with_capacity(self.nodes[idx].depth);
        while let Some(parent) = self.nodes[idx].parent {
            values.push(self.nodes[idx].value.clone());
            idx = parent;
        }
        values.reverse();
        PivotPath(values)
    }
}
