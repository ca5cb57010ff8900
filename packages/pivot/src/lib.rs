// src/lib.rs

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;


// Re-export commonly used types for convenience
pub use config::{EngineConfig, PivotConfig};
pub use engine::aggregate::{AggKind, AggSpec, Aggregator, StandardAggregator};
pub use engine::context::{InputPort, PivotContext};
pub use engine::pool::{CycleHook, CycleStats, DataSignal, Epoch, Pool, Stage, StageId, UpdateTask};
pub use engine::traversal::{SortOrder, SortSpec, TraversalNode, TraversalView};
pub use engine::types::{NodeIdx, Operation, PivotPath, Row, RowKey, RowUpdate, Scalar, ROOT};
pub use engine::update::{FlatRow, ViewDelta};
pub use error::{PivotError, Result};
