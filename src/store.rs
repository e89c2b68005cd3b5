use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::dimension::Dimension;
use crate::document::{self, RowId, VIRTUAL_ID_BASE};
use crate::error::{Error, Result};
use crate::group::{AccumulatorKind, GroupTable};

/// Base document slots and the live set.
#[derive(Debug, Default)]
pub struct Rows {
    docs: Vec<Option<Arc<Value>>>,
    live: BTreeSet<RowId>,
}

impl Rows {
    /// Live base document, `None` for dead, unknown and virtual ids.
    pub fn get(&self, id: RowId) -> Option<&Arc<Value>> {
        if !self.live.contains(&id) {
            return None;
        }
        self.docs.get(usize::try_from(id).ok()?)?.as_ref()
    }

    pub fn is_live(&self, id: RowId) -> bool {
        self.live.contains(&id)
    }

    /// Live ids in ascending (insertion) order.
    pub fn live_ids(&self) -> impl Iterator<Item = RowId> + '_ {
        self.live.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Mutable side state shared by every plan over the store: dimensions,
/// named group tables and the virtual id counter.
#[derive(Debug)]
pub struct SideTables {
    dimensions: HashMap<String, Dimension>,
    group_tables: HashMap<String, GroupTable>,
    next_virtual: RowId,
}

impl Default for SideTables {
    fn default() -> Self {
        Self {
            dimensions: HashMap::new(),
            group_tables: HashMap::new(),
            next_virtual: VIRTUAL_ID_BASE,
        }
    }
}

impl SideTables {
    pub fn allocate_virtual(&mut self) -> RowId {
        let id = self.next_virtual;
        self.next_virtual += 1;
        id
    }

    /// Dimension over `field`, built from the live rows on first use.
    pub fn dimension(&mut self, field: &str, rows: &Rows) -> &Dimension {
        self.dimensions.entry(field.to_string()).or_insert_with(|| {
            let mut dim = Dimension::new(field);
            for id in rows.live_ids() {
                if let Some(doc) = rows.get(id) {
                    dim.insert_value(id, doc);
                }
            }
            dim
        })
    }

    pub fn has_dimension(&self, field: &str) -> bool {
        self.dimensions.contains_key(field)
    }

    pub fn dimension_fields(&self) -> Vec<String> {
        self.dimensions.keys().cloned().collect()
    }

    /// Stop maintaining every dimension whose field is not in `keep`.
    pub fn retain_dimensions(&mut self, keep: &[String]) {
        self.dimensions.retain(|field, _| keep.contains(field));
    }

    pub fn group_table(&self, name: &str) -> Option<&GroupTable> {
        self.group_tables.get(name)
    }

    pub fn group_table_mut(&mut self, name: &str, kinds: &[AccumulatorKind]) -> &mut GroupTable {
        self.group_tables
            .entry(name.to_string())
            .or_insert_with(|| GroupTable::new(kinds.to_vec()))
    }

    pub fn drop_group_tables(&mut self, prefix: &str) {
        self.group_tables.retain(|name, _| !name.starts_with(prefix));
    }

    fn index(&mut self, id: RowId, doc: &Value) {
        for dim in self.dimensions.values_mut() {
            dim.insert_value(id, doc);
        }
    }

    fn unindex(&mut self, id: RowId, doc: &Value) {
        for dim in self.dimensions.values_mut() {
            dim.remove_value(id, doc);
        }
    }
}

/// Document store with stable row ids. Removal marks a row dead; slots are
/// never compacted or reused.
#[derive(Debug, Default)]
pub struct RowStore {
    rows: Rows,
    tables: SideTables,
}

impl RowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, doc: Value) -> Result<RowId> {
        let doc = Arc::new(document::validate(doc)?);
        let id = self.rows.docs.len() as RowId;
        self.tables.index(id, &doc);
        self.rows.docs.push(Some(doc));
        self.rows.live.insert(id);
        Ok(id)
    }

    pub fn remove(&mut self, id: RowId) -> Result<Arc<Value>> {
        if !self.rows.live.remove(&id) {
            return Err(Error::RowNotFound(id));
        }
        let doc = self
            .rows
            .docs
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(Error::RowNotFound(id))?;
        self.tables.unindex(id, &doc);
        Ok(doc)
    }

    /// Whole-document replacement. Returns the previous document.
    pub fn replace(&mut self, id: RowId, doc: Value) -> Result<Arc<Value>> {
        let doc = Arc::new(document::validate(doc)?);
        if !self.rows.live.contains(&id) {
            return Err(Error::RowNotFound(id));
        }
        let slot = self
            .rows
            .docs
            .get_mut(id as usize)
            .ok_or(Error::RowNotFound(id))?;
        let old = slot.replace(doc.clone()).ok_or(Error::RowNotFound(id))?;
        self.tables.unindex(id, &old);
        self.tables.index(id, &doc);
        Ok(old)
    }

    pub fn get(&self, id: RowId) -> Option<Arc<Value>> {
        self.rows.get(id).cloned()
    }

    pub fn is_live(&self, id: RowId) -> bool {
        self.rows.is_live(id)
    }

    pub fn live_ids(&self) -> Vec<RowId> {
        self.rows.live_ids().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn allocate_virtual(&mut self) -> RowId {
        self.tables.allocate_virtual()
    }

    pub fn dimension(&mut self, field: &str) -> &Dimension {
        self.tables.dimension(field, &self.rows)
    }

    pub fn group_table(&self, name: &str) -> Option<&GroupTable> {
        self.tables.group_table(name)
    }

    pub fn has_dimension(&self, field: &str) -> bool {
        self.tables.has_dimension(field)
    }

    pub fn drop_group_tables(&mut self, prefix: &str) {
        self.tables.drop_group_tables(prefix);
    }

    pub fn rows(&self) -> &Rows {
        &self.rows
    }

    /// Read access to documents alongside write access to side tables.
    pub fn parts(&mut self) -> (&Rows, &mut SideTables) {
        (&self.rows, &mut self.tables)
    }

    pub fn clear(&mut self) {
        self.rows = Rows::default();
        self.tables = SideTables::default();
    }
}
