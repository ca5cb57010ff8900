//! Strand table: one row per unique pivot path touched by a batch.

use super::aggregate::AggDelta;
use super::types::{PivotPath, Row, RowChange, Scalar};
use crate::config::PivotConfig;
use crate::error::Result;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use tracing::trace;

/// A unique pivot path's net contribution from one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StrandRow {
    pub path: PivotPath,
    /// Per-level grouping sort keys, empty when the batch left no row image
    /// on this path to read them from.
    pub sort_keys: Vec<Scalar>,
    /// Net change in contributing rows.
    pub nstrands: i64,
}

/// Companion of a [`StrandRow`]: per-aggregate contributions, same order as
/// the configured aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct StrandDeltaRow {
    pub path: PivotPath,
    pub aggs: Vec<AggDelta>,
}

#[derive(Debug, Clone, Default)]
pub struct StrandTable {
    pub rows: Vec<StrandRow>,
    pub deltas: Vec<StrandDeltaRow>,
}

impl StrandTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StrandRow, &StrandDeltaRow)> {
        self.rows.iter().zip(self.deltas.iter())
    }
}

/// Groups raw row changes by pivot path.
pub trait StrandBuilder: Send + Sync {
    fn build(&self, changes: &[RowChange], config: &PivotConfig) -> Result<StrandTable>;
}

/// Reference builder: a before image retracts one strand from its path, an
/// after image asserts one. An update that moves a row between paths
/// touches both.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupingStrandBuilder;

impl GroupingStrandBuilder {
    /// Pivot values up to the first absent or null one.
    pub fn path_of(row: &Row, config: &PivotConfig) -> PivotPath {
        config
            .pivots
            .iter()
            .map_while(|column| row.get(column).filter(|v| !v.is_null()).cloned())
            .collect()
    }

    fn sort_keys_of(row: &Row, path: &PivotPath, config: &PivotConfig) -> Vec<Scalar> {
        config
            .pivots
            .iter()
            .zip(path.segments())
            .map(|(pivot, value)| {
                config
                    .tree_sortby
                    .get(pivot)
                    .and_then(|sort_col| row.get(sort_col).cloned())
                    .unwrap_or_else(|| value.clone())
            })
            .collect()
    }
}

struct Pending {
    sort_keys: Vec<Scalar>,
    nstrands: i64,
    aggs: Vec<AggDelta>,
}

type Grouped = IndexMap<PivotPath, Pending, FxBuildHasher>;

fn pending_for(grouped: &mut Grouped, path: PivotPath, naggs: usize) -> &mut Pending {
    grouped.entry(path).or_insert_with(|| Pending {
        sort_keys: Vec::new(),
        nstrands: 0,
        aggs: vec![AggDelta::default(); naggs],
    })
}

impl StrandBuilder for GroupingStrandBuilder {
    fn build(&self, changes: &[RowChange], config: &PivotConfig) -> Result<StrandTable> {
        let naggs = config.aggregates.len();
        let mut grouped = Grouped::default();

        for change in changes {
            if let Some(prev) = &change.prev {
                let pending = pending_for(&mut grouped, Self::path_of(prev, config), naggs);
                pending.nstrands -= 1;
                for (spec, delta) in config.aggregates.iter().zip(pending.aggs.iter_mut()) {
                    delta.retracted.push(spec.contribution(prev));
                }
            }
            if let Some(current) = &change.current {
                let path = Self::path_of(current, config);
                let sort_keys = Self::sort_keys_of(current, &path, config);
                let pending = pending_for(&mut grouped, path, naggs);
                pending.nstrands += 1;
                // largest key wins within a batch
                if sort_keys > pending.sort_keys {
                    pending.sort_keys = sort_keys;
                }
                for (spec, delta) in config.aggregates.iter().zip(pending.aggs.iter_mut()) {
                    delta.asserted.push(spec.contribution(current));
                }
            }
        }

        let mut table = StrandTable {
            rows: Vec::with_capacity(grouped.len()),
            deltas: Vec::with_capacity(grouped.len()),
        };
        for (path, pending) in grouped {
            table.deltas.push(StrandDeltaRow {
                path: path.clone(),
                aggs: pending.aggs,
            });
            table.rows.push(StrandRow {
                path,
                sort_keys: pending.sort_keys,
                nstrands: pending.nstrands,
            });
        }
        trace!(changes = changes.len(), strands = table.len(), "strand table built");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregate::AggSpec;
    use crate::engine::types::row_from_json;
    use serde_json::json;

    fn config() -> PivotConfig {
        PivotConfig::new(["region", "sub"], vec![AggSpec::sum("count", "count")])
    }

    fn path(values: &[&str]) -> PivotPath {
        values.iter().copied().collect()
    }

    #[test]
    fn test_path_truncates_at_missing_pivot() {
        let cfg = config();
        let full = row_from_json(json!({"region": "EU", "sub": "DE"}));
        let partial = row_from_json(json!({"region": "EU"}));
        let nulled = row_from_json(json!({"region": "EU", "sub": null}));
        let gap = row_from_json(json!({"sub": "DE"}));
        assert_eq!(GroupingStrandBuilder::path_of(&full, &cfg), path(&["EU", "DE"]));
        assert_eq!(GroupingStrandBuilder::path_of(&partial, &cfg), path(&["EU"]));
        assert_eq!(GroupingStrandBuilder::path_of(&nulled, &cfg), path(&["EU"]));
        assert_eq!(GroupingStrandBuilder::path_of(&gap, &cfg), PivotPath::new());
    }

    #[test]
    fn test_one_row_per_unique_path() {
        let changes = vec![
            RowChange::insert("a", row_from_json(json!({"region": "EU", "count": 5}))),
            RowChange::insert("b", row_from_json(json!({"region": "EU", "sub": "DE", "count": 5}))),
            RowChange::insert("c", row_from_json(json!({"region": "EU", "sub": "DE", "count": 1}))),
        ];
        let table = GroupingStrandBuilder.build(&changes, &config()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0].path, path(&["EU"]));
        assert_eq!(table.rows[1].path, path(&["EU", "DE"]));
        assert_eq!(table.rows[1].nstrands, 2);
        assert_eq!(table.deltas[1].aggs[0].asserted.len(), 2);
    }

    #[test]
    fn test_move_between_paths_touches_both() {
        let changes = vec![RowChange {
            id: "a".into(),
            prev: Some(row_from_json(json!({"region": "EU", "count": 5}))),
            current: Some(row_from_json(json!({"region": "US", "count": 5}))),
        }];
        let table = GroupingStrandBuilder.build(&changes, &config()).unwrap();
        let eu = &table.rows[0];
        let us = &table.rows[1];
        assert_eq!((eu.path.clone(), eu.nstrands), (path(&["EU"]), -1));
        assert!(eu.sort_keys.is_empty());
        assert_eq!((us.path.clone(), us.nstrands), (path(&["US"]), 1));
        assert_eq!(us.sort_keys, vec![Scalar::from("US")]);
    }

    #[test]
    fn test_net_zero_path_still_reported() {
        let changes = vec![RowChange {
            id: "a".into(),
            prev: Some(row_from_json(json!({"region": "EU", "count": 5}))),
            current: Some(row_from_json(json!({"region": "EU", "count": 7}))),
        }];
        let table = GroupingStrandBuilder.build(&changes, &config()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0].nstrands, 0);
        let agg = &table.deltas[0].aggs[0];
        assert_eq!(agg.retracted, vec![Scalar::from(5.0)]);
        assert_eq!(agg.asserted, vec![Scalar::from(7.0)]);
    }

    #[test]
    fn test_tree_sortby_column() {
        let mut cfg = config();
        cfg.tree_sortby.insert("region".into(), "rank".into());
        let changes = vec![RowChange::insert(
            "a",
            row_from_json(json!({"region": "EU", "sub": "DE", "rank": 2})),
        )];
        let table = GroupingStrandBuilder.build(&changes, &cfg).unwrap();
        assert_eq!(table.rows[0].sort_keys, vec![Scalar::from(2.0), Scalar::from("DE")]);
    }

    #[test]
    fn test_sort_key_independent_of_arrival_order() {
        let mut cfg = config();
        cfg.tree_sortby.insert("region".into(), "rank".into());
        let low = RowChange::insert("a", row_from_json(json!({"region": "EU", "rank": 2})));
        let high = RowChange::insert("b", row_from_json(json!({"region": "EU", "rank": 5})));

        let forward = GroupingStrandBuilder
            .build(&[low.clone(), high.clone()], &cfg)
            .unwrap();
        let backward = GroupingStrandBuilder.build(&[high, low], &cfg).unwrap();
        assert_eq!(forward.rows[0].sort_keys, vec![Scalar::from(5.0)]);
        assert_eq!(backward.rows[0].sort_keys, forward.rows[0].sort_keys);
    }
}
