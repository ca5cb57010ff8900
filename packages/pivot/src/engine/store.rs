//! In-memory row storage feeding a pivot context.
//!
//! The store is the engine's stand-in for the columnar storage layer: it
//! applies row mutations and reports the before/after images each mutation
//! produced, which is what the strand builder consumes.

use super::types::{FastMap, Operation, Row, RowChange, RowKey, RowUpdate};
use tracing::trace;

/// Read-only view of committed rows, handed to aggregate evaluation.
pub trait Snapshot {
    fn row(&self, id: &str) -> Option<&Row>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct RowStore {
    rows: FastMap<RowKey, Row>,
}

impl RowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Applies one mutation. Create and Update are upserts; deleting an
    /// absent row changes nothing and yields `None`.
    pub fn apply_mutation(&mut self, op: Operation, key: RowKey, data: Row) -> Option<RowChange> {
        match op {
            Operation::Create | Operation::Update => {
                let prev = self.rows.insert(key.clone(), data.clone());
                Some(RowChange {
                    id: key,
                    prev,
                    current: Some(data),
                })
            }
            Operation::Delete => {
                let prev = self.rows.remove(&key)?;
                Some(RowChange::remove(key, prev))
            }
        }
    }

    /// Applies a batch in order and returns the changes it produced.
    pub fn apply_batch(&mut self, updates: impl IntoIterator<Item = RowUpdate>) -> Vec<RowChange> {
        let changes: Vec<RowChange> = updates
            .into_iter()
            .filter_map(|u| self.apply_mutation(u.op, u.id, u.data))
            .collect();
        trace!(changes = changes.len(), rows = self.rows.len(), "row batch applied");
        changes
    }

    /// Undoes `changes` (as returned by `apply_batch`), newest first.
    pub fn revert(&mut self, changes: &[RowChange]) {
        for change in changes.iter().rev() {
            match &change.prev {
                Some(prev) => {
                    self.rows.insert(change.id.clone(), prev.clone());
                }
                None => {
                    self.rows.remove(&change.id);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &Row)> {
        self.rows.iter()
    }
}

impl Snapshot for RowStore {
    fn row(&self, id: &str) -> Option<&Row> {
        self.rows.get(id)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}
