use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::{Capabilities, Operator, Resolver, RunBuffer, StageContext};
use crate::compile::{ExprCache, ExprFn};
use crate::delta::{Delta, RowKey};
use crate::error::Result;
use crate::group::{AccumulatorKind, GroupChange, GroupTable};
use crate::pipeline::AccumulatorSpec;
use crate::store::SideTables;
use crate::value::ValueKey;

/// `$group`: folds rows into the named group table in the store and emits
/// deltas addressed to group rows. A changed group is retracted and then
/// re-asserted so downstream stages see the new version.
pub struct GroupOp {
    table: String,
    key: ExprFn,
    accumulators: Vec<ExprFn>,
    kinds: Vec<AccumulatorKind>,
    fields: Vec<String>,
    /// Rank order-sensitive contributions by their position in the input
    /// list. Set when an upstream stage reorders rows.
    positional: bool,
    /// Current output document per encoded group key.
    outputs: HashMap<String, Arc<Value>>,
    /// Ordered output list, valid for the run that built it.
    listing: RunBuffer<RowKey>,
}

impl GroupOp {
    pub fn new(
        table: String,
        key: &Value,
        accumulators: &[AccumulatorSpec],
        positional: bool,
        cache: &mut ExprCache,
    ) -> Self {
        Self {
            table,
            key: cache.expression(key),
            accumulators: accumulators.iter().map(|a| cache.expression(&a.expr)).collect(),
            kinds: accumulators.iter().map(|a| a.kind).collect(),
            fields: accumulators.iter().map(|a| a.name.clone()).collect(),
            positional,
            outputs: HashMap::new(),
            listing: RunBuffer::default(),
        }
    }

    fn table<'t>(&self, tables: &'t mut SideTables) -> &'t mut GroupTable {
        tables.group_table_mut(&self.table, &self.kinds)
    }

    /// Fold `row` into its group without emitting deltas.
    fn fold(
        &mut self,
        row: &RowKey,
        rank: u64,
        doc: &Value,
        tables: &mut SideTables,
    ) -> GroupChange {
        let key_value = (self.key)(doc);
        let key = ValueKey::from_json(&key_value).encode();
        let values = self.accumulators.iter().map(|f| f(doc)).collect();
        let change = self.table(tables).add_row(row.clone(), rank, key, key_value, values);
        self.listing.invalidate();
        change
    }

    fn refresh(&mut self, key: &str, tables: &mut SideTables) {
        let doc = self
            .table(tables)
            .get(key)
            .map(|state| Arc::new(state.document(&self.fields)));
        match doc {
            Some(doc) => {
                self.outputs.insert(key.to_string(), doc);
            }
            None => {
                self.outputs.remove(key);
            }
        }
    }

    fn emit(&mut self, change: GroupChange, tables: &mut SideTables) -> Vec<Delta> {
        match change {
            GroupChange::Created(key) => {
                self.refresh(&key, tables);
                vec![Delta::add(RowKey::group(&key))]
            }
            GroupChange::Updated(key) => {
                self.refresh(&key, tables);
                let row = RowKey::group(&key);
                vec![Delta::remove(row.clone()), Delta::add(row)]
            }
            GroupChange::Destroyed(key) => {
                self.outputs.remove(&key);
                vec![Delta::remove(RowKey::group(&key))]
            }
        }
    }
}

impl Operator for GroupOp {
    fn name(&self) -> &'static str {
        "$group"
    }

    fn on_add(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_add() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        if self.table(ctx.tables).contains_row(&delta.row) {
            ctx.check(false, || format!("$group: {} added twice", delta.row))?;
            out = self.on_remove(&Delta::remove(delta.row.clone()), ctx)?;
        }
        let Some(doc) = ctx.resolve(&delta.row) else {
            return Ok(out);
        };
        let change = self.fold(&delta.row, 0, &doc, ctx.tables);
        out.extend(self.emit(change, ctx.tables));
        Ok(out)
    }

    fn on_remove(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_remove() {
            return Ok(Vec::new());
        }
        let Some(change) = self.table(ctx.tables).remove_row(&delta.row) else {
            ctx.check(false, || format!("$group: removal of unknown {}", delta.row))?;
            return Ok(Vec::new());
        };
        self.listing.invalidate();
        Ok(self.emit(change, ctx.tables))
    }

    fn snapshot(&mut self, input: Vec<RowKey>, ctx: &mut StageContext<'_>) -> Result<Vec<RowKey>> {
        self.table(ctx.tables).clear();
        self.outputs.clear();
        self.listing.invalidate();
        for (pos, row) in input.iter().enumerate() {
            if let Some(doc) = ctx.resolve(row) {
                let rank = if self.positional { pos as u64 } else { 0 };
                self.fold(row, rank, &doc, ctx.tables);
            }
        }
        let table = self.table(ctx.tables);
        let docs: Vec<(String, Arc<Value>)> = table
            .iter()
            .map(|(key, state)| (key.clone(), Arc::new(state.document(&self.fields))))
            .collect();
        self.outputs = docs.into_iter().collect();
        self.active_rows(input, ctx)
    }

    /// Groups in lexicographic order of their encoded key.
    fn active_rows(
        &mut self,
        _input: Vec<RowKey>,
        ctx: &mut StageContext<'_>,
    ) -> Result<Vec<RowKey>> {
        if !self.listing.is_current(ctx.run) {
            let keys: Vec<RowKey> = self
                .table(ctx.tables)
                .iter()
                .map(|(key, _)| RowKey::group(key))
                .collect();
            self.listing.fill(ctx.run, keys);
        }
        Ok(self.listing.read(ctx.run)?.to_vec())
    }

    fn effective_document(&self, row: &RowKey, _upstream: &Resolver<'_>) -> Option<Arc<Value>> {
        match row {
            RowKey::Group(key) => self.outputs.get(key.as_ref()).cloned(),
            RowKey::Row(_) => None,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            aggregates: true,
            order_sensitive: self.kinds.iter().any(|k| k.is_order_sensitive()),
            ..Capabilities::incremental()
        }
    }

    fn reset(&mut self, tables: &mut SideTables) {
        self.table(tables).clear();
        self.outputs.clear();
        self.listing.invalidate();
    }
}
