use std::sync::Arc;

use serde_json::Value;

use super::{Capabilities, Operator, Resolver, StageContext};
use crate::delta::{Delta, RowKey};
use crate::error::Result;
use crate::pipeline::{compare_sort_values, sort_values, SortKey};
use crate::store::SideTables;
use crate::value::ValueKey;

/// `$sort`: deltas pass through; ordering is applied to the active list.
pub struct SortOp {
    keys: Vec<SortKey>,
}

impl SortOp {
    pub fn new(keys: Vec<SortKey>) -> Self {
        Self { keys }
    }

    /// Stable sort: ties keep their upstream order.
    fn order(&self, input: Vec<RowKey>, ctx: &StageContext<'_>) -> Vec<RowKey> {
        let mut keyed: Vec<(Vec<ValueKey>, RowKey)> = input
            .into_iter()
            .filter_map(|row| {
                let doc = ctx.resolve(&row)?;
                Some((sort_values(&self.keys, &doc), row))
            })
            .collect();
        keyed.sort_by(|a, b| compare_sort_values(&self.keys, &a.0, &b.0));
        keyed.into_iter().map(|(_, row)| row).collect()
    }
}

impl Operator for SortOp {
    fn name(&self) -> &'static str {
        "$sort"
    }

    fn on_add(&mut self, delta: &Delta, _ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        Ok(if delta.is_add() { vec![delta.clone()] } else { Vec::new() })
    }

    fn on_remove(&mut self, delta: &Delta, _ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        Ok(if delta.is_remove() { vec![delta.clone()] } else { Vec::new() })
    }

    fn snapshot(&mut self, input: Vec<RowKey>, ctx: &mut StageContext<'_>) -> Result<Vec<RowKey>> {
        Ok(self.order(input, ctx))
    }

    fn active_rows(
        &mut self,
        input: Vec<RowKey>,
        ctx: &mut StageContext<'_>,
    ) -> Result<Vec<RowKey>> {
        Ok(self.order(input, ctx))
    }

    fn effective_document(&self, row: &RowKey, upstream: &Resolver<'_>) -> Option<Arc<Value>> {
        upstream.resolve(row)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            order_sensitive: true,
            ..Capabilities::incremental()
        }
    }

    fn reset(&mut self, _tables: &mut SideTables) {}
}
