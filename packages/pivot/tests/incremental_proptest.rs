//! Property tests: a context fed batch by batch agrees with one built from
//! scratch over the same rows.

mod common;

use common::*;
use pivot_engine::{PivotConfig, PivotContext, RowUpdate, SortSpec};
use proptest::prelude::*;
use serde_json::json;

#[derive(Debug, Clone)]
enum Change {
    Upsert {
        id: u8,
        region: u8,
        sub: Option<u8>,
        count: i64,
    },
    Delete(u8),
}

#[derive(Debug, Clone)]
enum ViewOp {
    Keep,
    Expand(usize),
    Collapse(usize),
}

fn change() -> impl Strategy<Value = Change> {
    prop_oneof![
        3 => (0u8..10, 0u8..3, prop::option::of(0u8..3), 0i64..5)
            .prop_map(|(id, region, sub, count)| Change::Upsert { id, region, sub, count }),
        1 => (0u8..10).prop_map(Change::Delete),
    ]
}

fn view_op() -> impl Strategy<Value = ViewOp> {
    prop_oneof![
        2 => Just(ViewOp::Keep),
        1 => (0usize..12).prop_map(ViewOp::Expand),
        1 => (0usize..12).prop_map(ViewOp::Collapse),
    ]
}

fn batches() -> impl Strategy<Value = Vec<(Vec<Change>, ViewOp)>> {
    prop::collection::vec((prop::collection::vec(change(), 0..6), view_op()), 1..12)
}

fn to_update(change: &Change) -> RowUpdate {
    const REGIONS: [&str; 3] = ["AM", "EU", "AS"];
    const SUBS: [&str; 3] = ["x", "y", "z"];
    match change {
        Change::Upsert { id, region, sub, count } => {
            let mut data = json!({"region": REGIONS[*region as usize], "count": count});
            if let Some(sub) = sub {
                data["sub"] = json!(SUBS[*sub as usize]);
            }
            RowUpdate::create_json(format!("r{id}"), data)
        }
        Change::Delete(id) => RowUpdate::delete(format!("r{id}")),
    }
}

/// Same rows, same expansion, built in a single batch.
fn from_scratch(ctx: &PivotContext, config: PivotConfig) -> PivotContext {
    let mut fresh = setup_with(config);
    let rows: Vec<RowUpdate> = ctx
        .store()
        .iter()
        .map(|(id, row)| RowUpdate::create(id.clone(), row.clone()))
        .collect();
    fresh.step(rows).unwrap();
    fresh.apply_expansion_state(&ctx.expansion_state());
    fresh
}

fn run(config: PivotConfig, batches: Vec<(Vec<Change>, ViewOp)>) {
    let mut ctx = setup_with(config.clone());
    for (changes, op) in batches {
        ctx.step(changes.iter().map(to_update).collect()).unwrap();
        match op {
            ViewOp::Keep => {}
            ViewOp::Expand(row) => {
                ctx.expand(row);
            }
            ViewOp::Collapse(row) => {
                ctx.collapse(row);
            }
        }

        assert_tree_sound(ctx.tree());
        assert_view_consistent(ctx.tree(), ctx.view().unwrap());
        assert_matches_recompute(&ctx);

        let fresh = from_scratch(&ctx, config.clone());
        assert_eq!(ctx.rows(), fresh.rows());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Incremental maintenance matches a full rebuild after every batch.
    #[test]
    fn incremental_matches_rebuild(batches in batches()) {
        run(region_config(), batches);
    }

    /// Same, with siblings ordered by aggregate value.
    #[test]
    fn incremental_matches_rebuild_sorted(batches in batches()) {
        run(region_config().with_sort(vec![SortSpec::desc("count")]), batches);
    }

    /// Same, with only the first level expanded on insert.
    #[test]
    fn incremental_matches_rebuild_shallow(batches in batches()) {
        run(region_config().with_expand_depth(1), batches);
    }
}
