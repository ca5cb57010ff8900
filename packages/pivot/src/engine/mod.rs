pub mod aggregate;
pub mod context;
pub mod delta_tree;
pub mod diff;
pub mod notify;
pub mod pivot_tree;
pub mod pool;
pub mod store;
pub mod strand;
pub mod traversal;
pub mod types;
pub mod update;

// Public re-exports
pub use context::{InputPort, PivotContext};
pub use notify::notify_sparse_tree;
pub use pivot_tree::PivotTree;
pub use pool::{Pool, UpdateTask};
pub use traversal::TraversalView;
pub use update::ViewDelta;

pub use types::{FastHashSet, FastMap, NodeIdx, PivotPath, Row, RowKey, RowUpdate, Scalar, ROOT};
