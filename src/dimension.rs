use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::document::{get_path, RowId};
use crate::value::ValueKey;

// ---------------------------------------------------------------------------
// Single-field dimension
// ---------------------------------------------------------------------------

/// Value → row-set index over one dotted field path.
///
/// A missing field indexes as `null`. An array field is indexed under the
/// whole array and under each element, so equality probes agree with the
/// array-element semantics of `$match`.
#[derive(Debug)]
pub struct Dimension {
    pub field: String,
    tree: BTreeMap<ValueKey, BTreeSet<RowId>>,
}

impl Dimension {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            tree: BTreeMap::new(),
        }
    }

    fn keys_of(&self, data: &Value) -> Vec<ValueKey> {
        let Some(value) = get_path(data, &self.field) else {
            return vec![ValueKey::Null];
        };
        let mut keys = vec![ValueKey::from_json(value)];
        if let Value::Array(items) = value {
            for item in items {
                let key = ValueKey::from_json(item);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    pub fn insert_value(&mut self, id: RowId, data: &Value) {
        for key in self.keys_of(data) {
            self.tree.entry(key).or_default().insert(id);
        }
    }

    pub fn remove_value(&mut self, id: RowId, data: &Value) {
        for key in self.keys_of(data) {
            if let Some(set) = self.tree.get_mut(&key) {
                set.remove(&id);
                if set.is_empty() {
                    self.tree.remove(&key);
                }
            }
        }
    }

    // -- Lookups -------------------------------------------------------------

    pub fn find_eq(&self, value: &ValueKey) -> BTreeSet<RowId> {
        self.tree.get(value).cloned().unwrap_or_default()
    }

    pub fn find_in(&self, values: &[ValueKey]) -> BTreeSet<RowId> {
        let mut result = BTreeSet::new();
        for v in values {
            if let Some(ids) = self.tree.get(v) {
                result.extend(ids.iter().copied());
            }
        }
        result
    }

    pub fn count_eq(&self, value: &ValueKey) -> usize {
        self.tree.get(value).map_or(0, |ids| ids.len())
    }

    /// Distinct values in ascending order with their rows.
    pub fn iter(&self) -> impl Iterator<Item = (&ValueKey, &BTreeSet<RowId>)> {
        self.tree.iter()
    }

    pub fn distinct_count(&self) -> usize {
        self.tree.len()
    }
}
