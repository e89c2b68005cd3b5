use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::{Capabilities, Operator, Resolver, StageContext};
use crate::delta::{Delta, RowKey};
use crate::error::Result;
use crate::store::SideTables;

/// `$count`: a single output row `{field: n}` that exists while n > 0.
pub struct CountOp {
    field: String,
    row: RowKey,
    members: HashSet<RowKey>,
}

impl CountOp {
    pub fn new(field: String) -> Self {
        let row = RowKey::group(&field);
        Self {
            field,
            row,
            members: HashSet::new(),
        }
    }

    fn listing(&self) -> Vec<RowKey> {
        if self.members.is_empty() {
            Vec::new()
        } else {
            vec![self.row.clone()]
        }
    }
}

impl Operator for CountOp {
    fn name(&self) -> &'static str {
        "$count"
    }

    fn on_add(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_add() {
            return Ok(Vec::new());
        }
        if !self.members.insert(delta.row.clone()) {
            ctx.check(false, || format!("$count: {} added twice", delta.row))?;
            return Ok(Vec::new());
        }
        if self.members.len() == 1 {
            return Ok(vec![Delta::add(self.row.clone())]);
        }
        Ok(vec![Delta::remove(self.row.clone()), Delta::add(self.row.clone())])
    }

    fn on_remove(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_remove() {
            return Ok(Vec::new());
        }
        if !self.members.remove(&delta.row) {
            ctx.check(false, || format!("$count: removal of unknown {}", delta.row))?;
            return Ok(Vec::new());
        }
        if self.members.is_empty() {
            return Ok(vec![Delta::remove(self.row.clone())]);
        }
        Ok(vec![Delta::remove(self.row.clone()), Delta::add(self.row.clone())])
    }

    fn snapshot(&mut self, input: Vec<RowKey>, _ctx: &mut StageContext<'_>) -> Result<Vec<RowKey>> {
        self.members = input.into_iter().collect();
        Ok(self.listing())
    }

    fn active_rows(
        &mut self,
        _input: Vec<RowKey>,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Vec<RowKey>> {
        Ok(self.listing())
    }

    fn effective_document(&self, row: &RowKey, _upstream: &Resolver<'_>) -> Option<Arc<Value>> {
        if *row != self.row || self.members.is_empty() {
            return None;
        }
        let mut map = Map::new();
        map.insert(self.field.clone(), Value::from(self.members.len() as u64));
        Some(Arc::new(Value::Object(map)))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            aggregates: true,
            ..Capabilities::incremental()
        }
    }

    fn reset(&mut self, _tables: &mut SideTables) {
        self.members.clear();
    }
}
