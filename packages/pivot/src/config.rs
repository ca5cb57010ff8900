use crate::engine::aggregate::{AggKind, AggSpec};
use crate::engine::traversal::SortSpec;
use crate::error::{PivotError, Result};
use anyhow::{anyhow, Context};
use indexmap::IndexMap;
use serde_json::Value;
use smol_str::SmolStr;
use tracing::instrument;

/// What a pivot context groups by and computes.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotConfig {
    /// Group-by columns, outermost first.
    pub pivots: Vec<SmolStr>,
    pub aggregates: Vec<AggSpec>,
    /// Pivot column -> column whose value orders that level's siblings.
    pub tree_sortby: IndexMap<SmolStr, SmolStr>,
    /// Sibling order in the traversal view, by aggregate value.
    pub sort: Vec<SortSpec>,
    /// Nodes shallower than this are inserted expanded. `None` expands all.
    pub expand_depth: Option<usize>,
    /// Maintain a traversal view at all.
    pub process_traversal: bool,
}

impl PivotConfig {
    pub fn new<P: Into<SmolStr>>(pivots: impl IntoIterator<Item = P>, aggregates: Vec<AggSpec>) -> Self {
        Self {
            pivots: pivots.into_iter().map(Into::into).collect(),
            aggregates,
            tree_sortby: IndexMap::new(),
            sort: Vec::new(),
            expand_depth: None,
            process_traversal: true,
        }
    }

    pub fn with_sort(mut self, sort: Vec<SortSpec>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_expand_depth(mut self, depth: usize) -> Self {
        self.expand_depth = Some(depth);
        self
    }

    pub fn with_tree_sortby(mut self, pivot: impl Into<SmolStr>, column: impl Into<SmolStr>) -> Self {
        self.tree_sortby.insert(pivot.into(), column.into());
        self
    }

    /// Parses a JSON pivot request. Accepts snake_case and camelCase keys.
    #[instrument(skip(config))]
    pub fn from_json(config: Value) -> anyhow::Result<Self> {
        let pivots = config
            .get("pivots")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("Missing or invalid 'pivots'"))?
            .iter()
            .map(|v| v.as_str().map(SmolStr::new))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| anyhow!("'pivots' must be a list of column names"))?;

        let aggregates: Vec<AggSpec> = serde_json::from_value(
            config
                .get("aggregates")
                .cloned()
                .ok_or_else(|| anyhow!("Missing 'aggregates'"))?,
        )
        .context("Invalid 'aggregates'")?;

        let tree_sortby = match config.get("tree_sortby").or_else(|| config.get("treeSortby")) {
            Some(v) => serde_json::from_value(v.clone()).context("Invalid 'tree_sortby'")?,
            None => IndexMap::new(),
        };

        let sort = match config.get("sort") {
            Some(v) => serde_json::from_value(v.clone()).context("Invalid 'sort'")?,
            None => Vec::new(),
        };

        let expand_depth = match config.get("expand_depth").or_else(|| config.get("expandDepth")) {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| anyhow!("'expand_depth' must be a non-negative integer"))?
                    as usize,
            ),
        };

        let process_traversal = config
            .get("process_traversal")
            .or_else(|| config.get("processTraversal"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let parsed = Self {
            pivots,
            aggregates,
            tree_sortby,
            sort,
            expand_depth,
            process_traversal,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.aggregates.is_empty() {
            return Err(PivotError::Config("at least one aggregate is required".into()));
        }
        for (i, spec) in self.aggregates.iter().enumerate() {
            if self.aggregates[..i].iter().any(|s| s.name == spec.name) {
                return Err(PivotError::Config(format!("duplicate aggregate `{}`", spec.name)));
            }
            if spec.kind == AggKind::Sum && spec.column.is_none() {
                return Err(PivotError::Config(format!("sum aggregate `{}` needs a column", spec.name)));
            }
        }
        for sort in &self.sort {
            if !self.aggregates.iter().any(|s| s.name == sort.aggregate) {
                return Err(PivotError::Config(format!(
                    "sort references unknown aggregate `{}`",
                    sort.aggregate
                )));
            }
        }
        for pivot in self.tree_sortby.keys() {
            if !self.pivots.contains(pivot) {
                return Err(PivotError::Config(format!("tree_sortby names unknown pivot `{pivot}`")));
            }
        }
        Ok(())
    }
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// `tracing` filter directive.
    pub log_filter: String,
    /// Log per-cycle timing through the cycle hook.
    pub cycle_timing: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_filter: "pivot_engine=info".to_string(),
            cycle_timing: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            log_filter: lookup("PIVOT_LOG").unwrap_or(defaults.log_filter),
            cycle_timing: lookup("PIVOT_CYCLE_TIMING")
                .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(defaults.cycle_timing),
        }
    }
}
