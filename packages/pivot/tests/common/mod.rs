//! Shared helpers for pivot-engine integration tests.
#![allow(dead_code)]

use pivot_engine::engine::pivot_tree::PivotTree;
use pivot_engine::engine::store::RowStore;
use pivot_engine::engine::strand::GroupingStrandBuilder;
use pivot_engine::engine::types::FastHashSet;
use pivot_engine::{
    AggSpec, DataSignal, NodeIdx, PivotConfig, PivotContext, PivotPath, RowUpdate, Scalar, TraversalView, ROOT,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// `[region, sub]` pivots with `count` summed from the `count` column.
pub fn region_config() -> PivotConfig {
    PivotConfig::new(["region", "sub"], vec![AggSpec::sum("count", "count")])
}

pub fn setup() -> PivotContext {
    setup_with(region_config())
}

pub fn setup_with(config: PivotConfig) -> PivotContext {
    PivotContext::new("test", config, DataSignal::new()).expect("valid config")
}

pub fn row(id: &str, region: &str, sub: Option<&str>, count: i64) -> RowUpdate {
    let mut data = json!({"region": region, "count": count});
    if let (Some(sub), Value::Object(map)) = (sub, &mut data) {
        map.insert("sub".into(), json!(sub));
    }
    RowUpdate::create_json(id, data)
}

pub fn path(segments: &[&str]) -> PivotPath {
    segments.iter().copied().collect()
}

/// Visible rows as "/"-joined paths, root first.
pub fn labels(ctx: &PivotContext) -> Vec<String> {
    ctx.rows().iter().map(|r| r.path.to_string()).collect()
}

pub fn agg(ctx: &PivotContext, segments: &[&str], name: &str) -> Option<f64> {
    let idx = ctx.tree().find(&path(segments))?;
    ctx.tree().aggregate(idx, name).and_then(Scalar::as_f64)
}

/// A row exists iff its node is reachable through expanded ancestors, rows
/// are in pre-order and depths match the tree.
pub fn assert_view_consistent(tree: &PivotTree, view: &TraversalView) {
    let mut expected = FastHashSet::default();
    let mut stack = vec![ROOT];
    while let Some(idx) = stack.pop() {
        expected.insert(idx);
        if view.is_expanded(idx) {
            stack.extend(tree.children(idx));
        }
    }
    let shown: FastHashSet<NodeIdx> = view.iter().map(|n| n.tree_idx).collect();
    assert_eq!(shown.len(), view.len(), "a node is shown twice");
    assert_eq!(shown, expected, "visible set differs from expanded reachability");

    let mut chain: Vec<NodeIdx> = Vec::new();
    for row in view.iter() {
        let node = tree.get(row.tree_idx).expect("row points at a live node");
        assert_eq!(node.depth, row.depth);
        chain.truncate(row.depth);
        if let Some(&parent) = chain.last() {
            assert_eq!(node.parent, Some(parent), "row is not under its parent");
            assert!(view.is_expanded(parent));
        }
        chain.push(row.tree_idx);
    }
}

/// Every non-root node holds rows, and every parent/child link is mutual.
pub fn assert_tree_sound(tree: &PivotTree) {
    for node in tree.iter() {
        if node.idx != ROOT {
            assert!(node.nstrands > 0, "zero-strand node {} survived", tree.path(node.idx));
            let parent = node.parent.and_then(|p| tree.get(p)).expect("live parent");
            assert_eq!(parent.children.get(&node.key()), Some(&node.idx));
        }
        for &child in node.children.values() {
            assert_eq!(tree.get(child).and_then(|c| c.parent), Some(node.idx));
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct Expected {
    pub rows: i64,
    pub sums: Vec<f64>,
}

/// Per-path row counts and sums computed from scratch over `store`.
pub fn recompute(store: &RowStore, config: &PivotConfig) -> BTreeMap<PivotPath, Expected> {
    let mut out: BTreeMap<PivotPath, Expected> = BTreeMap::new();
    out.insert(
        PivotPath::new(),
        Expected {
            rows: 0,
            sums: vec![0.0; config.aggregates.len()],
        },
    );
    for (_, row) in store.iter() {
        let full = GroupingStrandBuilder::path_of(row, config);
        for depth in 0..=full.len() {
            let prefix = PivotPath(full.segments()[..depth].to_vec());
            let entry = out.entry(prefix).or_insert_with(|| Expected {
                rows: 0,
                sums: vec![0.0; config.aggregates.len()],
            });
            entry.rows += 1;
            for (sum, spec) in entry.sums.iter_mut().zip(&config.aggregates) {
                *sum += spec.contribution(row).as_f64().unwrap_or(0.0);
            }
        }
    }
    out
}

/// Tree contents match a from-scratch recomputation.
pub fn assert_matches_recompute(ctx: &PivotContext) {
    let expected = recompute(ctx.store(), ctx.config());
    let tree = ctx.tree();
    assert_eq!(tree.len(), expected.len(), "node count");
    for (p, exp) in &expected {
        let idx = tree.find(p).unwrap_or_else(|| panic!("missing node {p}"));
        let node = tree.get(idx).expect("live node");
        if idx != ROOT {
            assert_eq!(node.nstrands, exp.rows, "rows at {p}");
        }
        let sums: Vec<f64> = node.aggregates.iter().map(|v| v.as_f64().unwrap_or(f64::NAN)).collect();
        assert_eq!(sums, exp.sums, "aggregates at {p}");
    }
}
