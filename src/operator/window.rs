use std::sync::Arc;

use serde_json::Value;

use super::{Capabilities, Operator, Resolver, StageContext};
use crate::delta::{Delta, RowKey};
use crate::error::Result;
use crate::store::SideTables;

/// `$skip` and `$limit`: slice the upstream list without touching documents.
pub struct WindowOp {
    name: &'static str,
    skip: usize,
    limit: Option<usize>,
}

impl WindowOp {
    pub fn skip(n: u64) -> Self {
        Self {
            name: "$skip",
            skip: usize::try_from(n).unwrap_or(usize::MAX),
            limit: None,
        }
    }

    pub fn limit(n: u64) -> Self {
        Self {
            name: "$limit",
            skip: 0,
            limit: Some(usize::try_from(n).unwrap_or(usize::MAX)),
        }
    }

    fn slice(&self, input: Vec<RowKey>) -> Vec<RowKey> {
        let rows = input.into_iter().skip(self.skip);
        match self.limit {
            Some(n) => rows.take(n).collect(),
            None => rows.collect(),
        }
    }
}

impl Operator for WindowOp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn on_add(&mut self, delta: &Delta, _ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        Ok(if delta.is_add() { vec![delta.clone()] } else { Vec::new() })
    }

    fn on_remove(&mut self, delta: &Delta, _ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        Ok(if delta.is_remove() { vec![delta.clone()] } else { Vec::new() })
    }

    fn snapshot(&mut self, input: Vec<RowKey>, _ctx: &mut StageContext<'_>) -> Result<Vec<RowKey>> {
        Ok(self.slice(input))
    }

    fn active_rows(
        &mut self,
        input: Vec<RowKey>,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Vec<RowKey>> {
        Ok(self.slice(input))
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

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(ids: &[u64]) -> Vec<RowKey> {
        ids.iter().map(|id| RowKey::Row(*id)).collect()
    }

    #[test]
    fn skip_and_limit_slice() {
        assert_eq!(WindowOp::skip(2).slice(rows(&[1, 2, 3, 4])), rows(&[3, 4]));
        assert_eq!(WindowOp::limit(2).slice(rows(&[1, 2, 3, 4])), rows(&[1, 2]));
        assert_eq!(WindowOp::skip(9).slice(rows(&[1, 2])), rows(&[]));
        assert_eq!(WindowOp::limit(0).slice(rows(&[1, 2])), rows(&[]));
    }
}
