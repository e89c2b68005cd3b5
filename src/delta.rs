use std::fmt;
use std::sync::Arc;

use crate::document::RowId;

/// Address of a row flowing between stages.
///
/// Document rows (base and virtual) carry a `RowId`. Rows synthesized by
/// `$group` and `$count` are addressed by their serialized key, which is a
/// separate identifier space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    Row(RowId),
    Group(Arc<str>),
}

impl RowKey {
    pub fn group(key: &str) -> Self {
        RowKey::Group(Arc::from(key))
    }

    pub fn row_id(&self) -> Option<RowId> {
        match self {
            RowKey::Row(id) => Some(*id),
            RowKey::Group(_) => None,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Row(id) => write!(f, "row:{id}"),
            RowKey::Group(key) => write!(f, "group:{key:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    Add,
    Remove,
}

impl Sign {
    pub fn as_i32(self) -> i32 {
        match self {
            Sign::Add => 1,
            Sign::Remove => -1,
        }
    }
}

/// "This row became present" (+1) or "this row became absent" (-1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Delta {
    pub row: RowKey,
    pub sign: Sign,
}

impl Delta {
    pub fn add(row: RowKey) -> Self {
        Self { row, sign: Sign::Add }
    }

    pub fn remove(row: RowKey) -> Self {
        Self {
            row,
            sign: Sign::Remove,
        }
    }

    /// Insertion delta for a stored document row.
    pub fn insert(id: RowId) -> Self {
        Self::add(RowKey::Row(id))
    }

    /// Removal delta for a stored document row.
    pub fn delete(id: RowId) -> Self {
        Self::remove(RowKey::Row(id))
    }

    #[inline]
    pub fn is_add(&self) -> bool {
        self.sign == Sign::Add
    }

    #[inline]
    pub fn is_remove(&self) -> bool {
        self.sign == Sign::Remove
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_sign() {
        let d = Delta::insert(4);
        assert!(d.is_add());
        assert_eq!(d.row, RowKey::Row(4));
        assert_eq!(d.sign.as_i32(), 1);
        let d = Delta::delete(4);
        assert!(d.is_remove());
        assert_eq!(d.sign.as_i32(), -1);
    }

    #[test]
    fn document_rows_sort_before_group_rows() {
        assert!(RowKey::Row(u64::MAX) < RowKey::group(""));
        assert!(RowKey::group("a") < RowKey::group("b"));
    }
}
