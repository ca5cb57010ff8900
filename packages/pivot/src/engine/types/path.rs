use super::scalar::Scalar;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered pivot-key values from the root to a node, root first.
///
/// Ordering is lexicographic, so a prefix sorts before its extensions:
/// `[A] < [A, B] < [C]`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PivotPath(pub Vec<Scalar>);

impl PivotPath {
    pub fn new() -> Self {
        PivotPath(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[Scalar] {
        &self.0
    }
}

impl<S: Into<Scalar>> FromIterator<S> for PivotPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        PivotPath(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for PivotPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}
