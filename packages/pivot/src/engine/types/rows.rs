use super::scalar::Scalar;
use super::FastMap;
use serde_json::Value;
use smol_str::SmolStr;

pub type RowKey = SmolStr;

/// One row image: column name to value.
pub type Row = FastMap<SmolStr, Scalar>;

/// Builds a row from a JSON object. Non-object values yield an empty row.
pub fn row_from_json(value: Value) -> Row {
    match value {
        Value::Object(obj) => obj
            .into_iter()
            .map(|(k, v)| (SmolStr::from(k), Scalar::from(v)))
            .collect(),
        _ => Row::default(),
    }
}

/// Operation type for row mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// A single row mutation submitted to a pivot context.
#[derive(Debug, Clone)]
pub struct RowUpdate {
    pub op: Operation,
    pub id: RowKey,
    pub data: Row,
}

impl RowUpdate {
    pub fn new(op: Operation, id: impl Into<RowKey>, data: Row) -> Self {
        Self {
            op,
            id: id.into(),
            data,
        }
    }

    pub fn create(id: impl Into<RowKey>, data: Row) -> Self {
        Self::new(Operation::Create, id, data)
    }

    pub fn update(id: impl Into<RowKey>, data: Row) -> Self {
        Self::new(Operation::Update, id, data)
    }

    pub fn delete(id: impl Into<RowKey>) -> Self {
        Self::new(Operation::Delete, id, Row::default())
    }

    pub fn create_json(id: impl Into<RowKey>, data: Value) -> Self {
        Self::create(id, row_from_json(data))
    }

    pub fn update_json(id: impl Into<RowKey>, data: Value) -> Self {
        Self::update(id, row_from_json(data))
    }
}

/// Before/after images of one row, as produced by the storage layer for a batch.
///
/// `prev` is the row as it existed before the batch touched it, `current` the
/// row after. A pure insert has no `prev`, a delete has no `current`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub id: RowKey,
    pub prev: Option<Row>,
    pub current: Option<Row>,
}

impl RowChange {
    pub fn insert(id: impl Into<RowKey>, row: Row) -> Self {
        Self {
            id: id.into(),
            prev: None,
            current: Some(row),
        }
    }

    pub fn remove(id: impl Into<RowKey>, row: Row) -> Self {
        Self {
            id: id.into(),
            prev: Some(row),
            current: None,
        }
    }

    pub fn transition(&self) -> RowTransition {
        RowTransition::compute(self.prev.as_ref(), self.current.as_ref())
    }
}

/// Represents a row transition for delta computation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowTransition {
    /// Row newly appears
    Inserted,
    /// Row existed before and after, with different content
    Updated,
    /// Row removed entirely
    Removed,
    /// No change
    Unchanged,
}

impl RowTransition {
    pub fn compute(prev: Option<&Row>, current: Option<&Row>) -> Self {
        match (prev, current) {
            (None, Some(_)) => RowTransition::Inserted,
            (Some(_), None) => RowTransition::Removed,
            (Some(p), Some(c)) if p != c => RowTransition::Updated,
            _ => RowTransition::Unchanged,
        }
    }
}

#[cfg(test)]
mod rows_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_from_json() {
        let row = row_from_json(json!({"region": "EU", "count": 5}));
        assert_eq!(row.get("region"), Some(&Scalar::from("EU")));
        assert_eq!(row.get("count"), Some(&Scalar::from(5.0)));
        assert!(row_from_json(json!([1, 2])).is_empty());
    }

    #[test]
    fn test_transitions() {
        let a = row_from_json(json!({"v": 1}));
        let b = row_from_json(json!({"v": 2}));
        assert_eq!(RowChange::insert("r", a.clone()).transition(), RowTransition::Inserted);
        assert_eq!(RowChange::remove("r", a.clone()).transition(), RowTransition::Removed);

        let updated = RowChange {
            id: "r".into(),
            prev: Some(a.clone()),
            current: Some(b),
        };
        assert_eq!(updated.transition(), RowTransition::Updated);

        let same = RowChange {
            id: "r".into(),
            prev: Some(a.clone()),
            current: Some(a),
        };
        assert_eq!(same.transition(), RowTransition::Unchanged);
    }
}
