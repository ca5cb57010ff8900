use crate::engine::pool::StageId;
use crate::engine::types::NodeIdx;
use smol_str::SmolStr;
use thiserror::Error;

pub type Result<T, E = PivotError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PivotError {
    /// Upstream strand builder produced a path deeper than the pivot list.
    #[error("strand path has {got} levels but only {expected} pivots are configured")]
    PivotArity { expected: usize, got: usize },

    #[error("strand row and strand delta row disagree: {0}")]
    StrandMismatch(String),

    #[error("aggregate `{name}` failed: {reason}")]
    Aggregate { name: SmolStr, reason: String },

    #[error("unknown tree node {0}")]
    UnknownNode(NodeIdx),

    #[error("stage {0} is not registered")]
    UnknownStage(StageId),

    #[error("stage {0} has an unexpected type")]
    StageType(StageId),

    #[error("a recomputation cycle is already in flight")]
    CycleInFlight,

    #[error("stage {id} (`{name}`) failed")]
    Stage {
        id: StageId,
        name: SmolStr,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid pivot config: {0}")]
    Config(String),

    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl PivotError {
    pub fn aggregate(name: impl Into<SmolStr>, reason: impl Into<String>) -> Self {
        PivotError::Aggregate {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True for failures that originate in an upstream collaborator's contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            PivotError::PivotArity { .. } | PivotError::StrandMismatch(_)
        )
    }
}
