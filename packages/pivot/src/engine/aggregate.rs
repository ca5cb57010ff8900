//! Aggregate specifications and their incremental evaluation.

use super::store::Snapshot;
use super::types::{Row, Scalar};
use crate::error::{PivotError, Result};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AggKind {
    /// Numeric sum of a column; null cells are skipped.
    #[default]
    Sum,
    /// Number of contributing rows.
    Count,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AggSpec {
    pub name: SmolStr,
    #[serde(default)]
    pub column: Option<SmolStr>,
    #[serde(default)]
    pub kind: AggKind,
}

impl AggSpec {
    pub fn sum(name: impl Into<SmolStr>, column: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            column: Some(column.into()),
            kind: AggKind::Sum,
        }
    }

    pub fn count(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            column: None,
            kind: AggKind::Count,
        }
    }

    /// The value one row image contributes to this aggregate.
    pub fn contribution(&self, row: &Row) -> Scalar {
        match (&self.column, self.kind) {
            (_, AggKind::Count) => Scalar::Number(1.0),
            (Some(column), AggKind::Sum) => row.get(column).cloned().unwrap_or_default(),
            (None, AggKind::Sum) => Scalar::Null,
        }
    }
}

/// Contributions removed from and added to one aggregate by a batch.
///
/// `retracted` holds values from row images that went away (before),
/// `asserted` values from row images that appeared (after).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggDelta {
    pub retracted: Vec<Scalar>,
    pub asserted: Vec<Scalar>,
}

impl AggDelta {
    pub fn is_empty(&self) -> bool {
        self.retracted.is_empty() && self.asserted.is_empty()
    }

    pub fn merge(&mut self, other: &AggDelta) {
        self.retracted.extend(other.retracted.iter().cloned());
        self.asserted.extend(other.asserted.iter().cloned());
    }
}

/// Folds strand deltas into a node's aggregate state.
///
/// Implementations must be pure with respect to `prior`: a failure leaves
/// the caller free to discard the whole cycle.
pub trait Aggregator: Send + Sync {
    fn initial(&self, spec: &AggSpec) -> Scalar;

    fn fold(
        &self,
        spec: &AggSpec,
        prior: &Scalar,
        delta: &AggDelta,
        snapshot: &dyn Snapshot,
    ) -> Result<Scalar>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardAggregator;

impl StandardAggregator {
    fn numeric(spec: &AggSpec, value: &Scalar) -> Result<f64> {
        match value {
            Scalar::Null => Ok(0.0),
            Scalar::Number(n) => Ok(*n),
            other => Err(PivotError::aggregate(
                spec.name.clone(),
                format!("cannot sum non-numeric value `{other}`"),
            )),
        }
    }
}

impl Aggregator for StandardAggregator {
    fn initial(&self, _spec: &AggSpec) -> Scalar {
        Scalar::Number(0.0)
    }

    fn fold(
        &self,
        spec: &AggSpec,
        prior: &Scalar,
        delta: &AggDelta,
        _snapshot: &dyn Snapshot,
    ) -> Result<Scalar> {
        let mut acc = Self::numeric(spec, prior)?;
        match spec.kind {
            AggKind::Sum => {
                for value in &delta.asserted {
                    acc += Self::numeric(spec, value)?;
                }
                for value in &delta.retracted {
                    acc -= Self::numeric(spec, value)?;
                }
            }
            AggKind::Count => {
                acc += delta.asserted.len() as f64 - delta.retracted.len() as f64;
            }
        }
        Ok(Scalar::Number(acc))
    }
}
