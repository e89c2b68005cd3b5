//! Per-group accumulator state that supports exact removal.
//!
//! Every contributing row records its group key and evaluated accumulator
//! inputs, so removing a row never needs the row's document again.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::delta::RowKey;
use crate::value::{number_to_value, ValueKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorKind {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    Count,
}

impl AccumulatorKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => Self::Sum,
            "$avg" => Self::Avg,
            "$min" => Self::Min,
            "$max" => Self::Max,
            "$first" => Self::First,
            "$last" => Self::Last,
            "$push" => Self::Push,
            "$addToSet" => Self::AddToSet,
            "$count" => Self::Count,
            _ => return None,
        })
    }

    /// Result depends on the order rows arrive in.
    pub fn is_order_sensitive(self) -> bool {
        matches!(self, Self::First | Self::Last | Self::Push)
    }
}

// ---------------------------------------------------------------------------
// Accumulators
// ---------------------------------------------------------------------------

/// Exact numeric sum: integers in an i128, floats as a multiset summed in a
/// fixed order on read so the result never depends on insertion history.
#[derive(Debug, Default, Clone)]
struct ExactSum {
    ints: i128,
    floats: BTreeMap<u64, usize>,
    numeric: usize,
}

impl ExactSum {
    fn apply(&mut self, v: &Value, sign: i64) {
        let Value::Number(n) = v else {
            return;
        };
        if let Some(i) = n.as_i64() {
            self.ints += i128::from(i) * i128::from(sign);
        } else if let Some(f) = n.as_f64() {
            let bits = f.to_bits();
            if sign > 0 {
                *self.floats.entry(bits).or_default() += 1;
            } else if let Some(c) = self.floats.get_mut(&bits) {
                *c -= 1;
                if *c == 0 {
                    self.floats.remove(&bits);
                }
            }
        } else {
            return;
        }
        if sign > 0 {
            self.numeric += 1;
        } else {
            self.numeric -= 1;
        }
    }

    fn total(&self) -> Value {
        if self.floats.is_empty() {
            return match i64::try_from(self.ints) {
                Ok(i) => Value::from(i),
                Err(_) => number_to_value(self.ints as f64),
            };
        }
        number_to_value(self.ints as f64 + self.float_sum())
    }

    fn as_f64(&self) -> f64 {
        self.ints as f64 + self.float_sum()
    }

    fn float_sum(&self) -> f64 {
        let mut total = 0.0;
        for (bits, count) in &self.floats {
            let f = f64::from_bits(*bits);
            for _ in 0..*count {
                total += f;
            }
        }
        total
    }
}

/// The JSON values of every row contributing one comparison key. Values
/// such as `1` and `1.0` share a key; the one reported belongs to the
/// lowest contributing row key.
#[derive(Debug, Default, Clone)]
struct Spellings(BTreeMap<RowKey, Value>);

impl Spellings {
    fn representative(&self) -> Value {
        self.0.values().next().cloned().unwrap_or(Value::Null)
    }
}

/// Comparison keys with the rows contributing each, ordered by key.
#[derive(Debug, Clone)]
struct Multiset<K: Ord>(BTreeMap<K, Spellings>);

impl<K: Ord> Default for Multiset<K> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<K: Ord> Multiset<K> {
    fn insert(&mut self, key: K, row: &RowKey, v: &Value) {
        self.0.entry(key).or_default().0.insert(row.clone(), v.clone());
    }

    fn remove(&mut self, key: &K, row: &RowKey) {
        if let Some(entry) = self.0.get_mut(key) {
            entry.0.remove(row);
            if entry.0.is_empty() {
                self.0.remove(key);
            }
        }
    }

    fn values(&self) -> impl DoubleEndedIterator<Item = Value> + '_ {
        self.0.values().map(Spellings::representative)
    }
}

#[derive(Debug, Clone)]
enum AccState {
    Sum(ExactSum),
    Avg(ExactSum),
    Min(Multiset<ValueKey>),
    Max(Multiset<ValueKey>),
    /// First/Last/Push: contributions ordered by (rank, row key).
    Ordered(AccumulatorKind, BTreeMap<(u64, RowKey), Value>),
    AddToSet(Multiset<String>),
    Count(u64),
}

impl AccState {
    fn new(kind: AccumulatorKind) -> Self {
        match kind {
            AccumulatorKind::Sum => AccState::Sum(ExactSum::default()),
            AccumulatorKind::Avg => AccState::Avg(ExactSum::default()),
            AccumulatorKind::Min => AccState::Min(Multiset::default()),
            AccumulatorKind::Max => AccState::Max(Multiset::default()),
            AccumulatorKind::First | AccumulatorKind::Last | AccumulatorKind::Push => {
                AccState::Ordered(kind, BTreeMap::new())
            }
            AccumulatorKind::AddToSet => AccState::AddToSet(Multiset::default()),
            AccumulatorKind::Count => AccState::Count(0),
        }
    }

    fn add(&mut self, order: &(u64, RowKey), v: &Value) {
        match self {
            AccState::Sum(s) | AccState::Avg(s) => s.apply(v, 1),
            AccState::Min(m) | AccState::Max(m) => {
                if !v.is_null() {
                    m.insert(ValueKey::from_json(v), &order.1, v);
                }
            }
            AccState::Ordered(_, entries) => {
                entries.insert(order.clone(), v.clone());
            }
            AccState::AddToSet(set) => set.insert(ValueKey::from_json(v).encode(), &order.1, v),
            AccState::Count(n) => *n += 1,
        }
    }

    fn remove(&mut self, order: &(u64, RowKey), v: &Value) {
        match self {
            AccState::Sum(s) | AccState::Avg(s) => s.apply(v, -1),
            AccState::Min(m) | AccState::Max(m) => {
                if !v.is_null() {
                    m.remove(&ValueKey::from_json(v), &order.1);
                }
            }
            AccState::Ordered(_, entries) => {
                entries.remove(order);
            }
            AccState::AddToSet(set) => set.remove(&ValueKey::from_json(v).encode(), &order.1),
            AccState::Count(n) => *n = n.saturating_sub(1),
        }
    }

    fn result(&self) -> Value {
        match self {
            AccState::Sum(s) => s.total(),
            AccState::Avg(s) if s.numeric == 0 => Value::Null,
            AccState::Avg(s) => number_to_value(s.as_f64() / s.numeric as f64),
            AccState::Min(m) => m.values().next().unwrap_or(Value::Null),
            AccState::Max(m) => m.values().next_back().unwrap_or(Value::Null),
            AccState::Ordered(AccumulatorKind::First, e) => {
                e.values().next().cloned().unwrap_or(Value::Null)
            }
            AccState::Ordered(AccumulatorKind::Last, e) => {
                e.values().next_back().cloned().unwrap_or(Value::Null)
            }
            AccState::Ordered(_, e) => Value::Array(e.values().cloned().collect()),
            AccState::AddToSet(set) => Value::Array(set.values().collect()),
            AccState::Count(n) => Value::from(*n),
        }
    }
}

// ---------------------------------------------------------------------------
// Group table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GroupState {
    /// Contributing rows with the `_id` value each produced. The group table
    /// is the dimension of its key.
    members: BTreeMap<RowKey, Value>,
    accs: Vec<AccState>,
}

impl GroupState {
    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> impl Iterator<Item = &RowKey> {
        self.members.keys()
    }

    /// The `_id` of the group as written by its lowest contributing row.
    pub fn key_value(&self) -> Value {
        self.members.values().next().cloned().unwrap_or(Value::Null)
    }

    /// Output row: `_id` followed by accumulator fields in declaration order.
    pub fn document(&self, fields: &[String]) -> Value {
        let mut map = Map::new();
        map.insert("_id".to_string(), self.key_value());
        for (name, acc) in fields.iter().zip(&self.accs) {
            map.insert(name.clone(), acc.result());
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone)]
struct Contribution {
    key: String,
    rank: u64,
    values: Vec<Value>,
}

/// Effect of one row on the table, addressed by encoded group key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupChange {
    Created(String),
    Updated(String),
    Destroyed(String),
}

#[derive(Debug, Clone)]
pub struct GroupTable {
    kinds: Vec<AccumulatorKind>,
    groups: BTreeMap<String, GroupState>,
    rows: HashMap<RowKey, Contribution>,
}

impl GroupTable {
    pub fn new(kinds: Vec<AccumulatorKind>) -> Self {
        Self {
            kinds,
            groups: BTreeMap::new(),
            rows: HashMap::new(),
        }
    }

    /// Fold a row into the group `key`. A row already present is moved.
    /// Order-sensitive accumulators order contributions by `rank`, then by
    /// row key.
    pub fn add_row(
        &mut self,
        row: RowKey,
        rank: u64,
        key: String,
        key_value: Value,
        values: Vec<Value>,
    ) -> GroupChange {
        if self.rows.contains_key(&row) {
            self.remove_row(&row);
        }
        let kinds = &self.kinds;
        let mut created = false;
        let state = self.groups.entry(key.clone()).or_insert_with(|| {
            created = true;
            GroupState {
                members: BTreeMap::new(),
                accs: kinds.iter().map(|k| AccState::new(*k)).collect(),
            }
        });
        state.members.insert(row.clone(), key_value);
        let order = (rank, row.clone());
        for (acc, v) in state.accs.iter_mut().zip(&values) {
            acc.add(&order, v);
        }
        self.rows.insert(row, Contribution { key: key.clone(), rank, values });
        if created {
            GroupChange::Created(key)
        } else {
            GroupChange::Updated(key)
        }
    }

    /// Undo `add_row` using the stored contribution. `None` when the row
    /// never contributed.
    pub fn remove_row(&mut self, row: &RowKey) -> Option<GroupChange> {
        let contribution = self.rows.remove(row)?;
        let state = self.groups.get_mut(&contribution.key)?;
        state.members.remove(row);
        if state.members.is_empty() {
            self.groups.remove(&contribution.key);
            return Some(GroupChange::Destroyed(contribution.key));
        }
        let order = (contribution.rank, row.clone());
        for (acc, v) in state.accs.iter_mut().zip(&contribution.values) {
            acc.remove(&order, v);
        }
        Some(GroupChange::Updated(contribution.key))
    }

    pub fn get(&self, key: &str) -> Option<&GroupState> {
        self.groups.get(key)
    }

    pub fn contains_row(&self, row: &RowKey) -> bool {
        self.rows.contains_key(row)
    }

    /// Groups in lexicographic order of their encoded key.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &GroupState)> {
        self.groups.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> GroupTable {
        GroupTable::new(vec![
            AccumulatorKind::Sum,
            AccumulatorKind::Avg,
            AccumulatorKind::Min,
            AccumulatorKind::Max,
            AccumulatorKind::First,
            AccumulatorKind::Push,
            AccumulatorKind::AddToSet,
            AccumulatorKind::Count,
        ])
    }

    fn fields() -> Vec<String> {
        ["sum", "avg", "min", "max", "first", "all", "set", "n"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn add(t: &mut GroupTable, row: u64, key: &str, v: Value) -> GroupChange {
        t.add_row(RowKey::Row(row), 0, key.into(), json!(key), vec![v; 8])
    }

    #[test]
    fn accumulates_and_reports_creation() {
        let mut t = table();
        assert_eq!(add(&mut t, 1, "a", json!(3)), GroupChange::Created("a".into()));
        assert_eq!(add(&mut t, 2, "a", json!(5)), GroupChange::Updated("a".into()));
        let doc = t.get("a").unwrap().document(&fields());
        assert_eq!(
            doc,
            json!({"_id": "a", "sum": 8, "avg": 4, "min": 3, "max": 5, "first": 3,
                   "all": [3, 5], "set": [3, 5], "n": 2})
        );
    }

    #[test]
    fn removal_is_exact_inverse() {
        let mut t = table();
        add(&mut t, 1, "a", json!(0.1));
        add(&mut t, 2, "a", json!(0.2));
        add(&mut t, 3, "a", json!(0.7));
        t.remove_row(&RowKey::Row(1));

        let mut fresh = table();
        add(&mut fresh, 2, "a", json!(0.2));
        add(&mut fresh, 3, "a", json!(0.7));
        assert_eq!(
            t.get("a").unwrap().document(&fields()),
            fresh.get("a").unwrap().document(&fields())
        );
    }

    #[test]
    fn min_max_survive_removal_of_extreme() {
        let mut t = table();
        add(&mut t, 1, "a", json!(1));
        add(&mut t, 2, "a", json!(9));
        add(&mut t, 3, "a", json!(9));
        t.remove_row(&RowKey::Row(2));
        let doc = t.get("a").unwrap().document(&fields());
        assert_eq!(doc["max"], json!(9));
        t.remove_row(&RowKey::Row(3));
        let doc = t.get("a").unwrap().document(&fields());
        assert_eq!(doc["max"], json!(1));
        assert_eq!(doc["set"], json!([1]));
    }

    #[test]
    fn last_contributor_destroys_group() {
        let mut t = table();
        add(&mut t, 1, "a", json!(1));
        assert_eq!(t.remove_row(&RowKey::Row(1)), Some(GroupChange::Destroyed("a".into())));
        assert!(t.is_empty());
        assert_eq!(t.remove_row(&RowKey::Row(1)), None);
    }

    #[test]
    fn sum_ignores_non_numeric_and_avg_of_nothing_is_null() {
        let mut t = table();
        add(&mut t, 1, "a", json!("x"));
        let doc = t.get("a").unwrap().document(&fields());
        assert_eq!(doc["sum"], json!(0));
        assert_eq!(doc["avg"], Value::Null);
        assert_eq!(doc["min"], json!("x"));
    }

    #[test]
    fn readding_a_row_moves_it() {
        let mut t = table();
        add(&mut t, 1, "a", json!(1));
        add(&mut t, 1, "b", json!(2));
        assert!(t.get("a").is_none());
        assert_eq!(t.get("b").unwrap().count(), 1);
    }

    #[test]
    fn ordered_accumulators_follow_row_keys() {
        let mut t = table();
        add(&mut t, 5, "a", json!("late"));
        add(&mut t, 2, "a", json!("early"));
        let doc = t.get("a").unwrap().document(&fields());
        assert_eq!(doc["first"], json!("early"));
        assert_eq!(doc["all"], json!(["early", "late"]));
    }

    #[test]
    fn equal_values_report_a_surviving_row() {
        let mut t = table();
        t.add_row(RowKey::Row(1), 0, "k".into(), json!(1), vec![json!(1); 8]);
        t.add_row(RowKey::Row(2), 0, "k".into(), json!(1.0), vec![json!(1.0); 8]);
        let doc = t.get("k").unwrap().document(&fields());
        assert_eq!(doc["_id"], json!(1));
        assert_eq!(doc["max"], json!(1));
        assert_eq!(doc["set"], json!([1]));

        t.remove_row(&RowKey::Row(1));
        let doc = t.get("k").unwrap().document(&fields());
        assert_eq!(doc["_id"], json!(1.0));
        assert_eq!(doc["min"], json!(1.0));
        assert_eq!(doc["max"], json!(1.0));
        assert_eq!(doc["set"], json!([1.0]));
    }

    #[test]
    fn rank_takes_precedence_over_row_key() {
        let mut t = GroupTable::new(vec![AccumulatorKind::First]);
        t.add_row(RowKey::Row(1), 1, "a".into(), json!("a"), vec![json!("second")]);
        t.add_row(RowKey::Row(9), 0, "a".into(), json!("a"), vec![json!("first")]);
        let doc = t.get("a").unwrap().document(&["f".to_string()]);
        assert_eq!(doc["f"], json!("first"));
    }
}
