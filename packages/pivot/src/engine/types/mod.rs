mod path;
mod rows;
mod scalar;

pub use path::PivotPath;
pub use rows::{row_from_json, Operation, Row, RowChange, RowKey, RowTransition, RowUpdate};
pub use scalar::Scalar;

use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub type FastMap<K, V> = std::collections::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FastHashSet<T> = std::collections::HashSet<T, BuildHasherDefault<FxHasher>>;

/// Index of a node in the pivot tree arena. Stable for the node's lifetime.
pub type NodeIdx = usize;

/// Arena index of the pivot tree root (the sentinel level).
pub const ROOT: NodeIdx = 0;
