use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde_json::Value;

use super::{Capabilities, Operator, Resolver, StageContext};
use crate::compile::{ExprCache, PredicateFn};
use crate::delta::{Delta, RowKey};
use crate::document::RowId;
use crate::error::Result;
use crate::query::parse_query;
use crate::store::SideTables;
use crate::value::ValueKey;

/// `$match`: keeps rows whose effective document satisfies the predicate.
/// The member set makes removal exact without re-evaluating the predicate.
pub struct MatchOp {
    predicate: PredicateFn,
    probe: Option<(String, Vec<ValueKey>)>,
    members: HashSet<RowKey>,
}

impl MatchOp {
    pub fn new(body: &Value, cache: &mut ExprCache) -> Result<Self> {
        let probe = parse_query(body)?
            .equality_probe()
            .map(|(field, keys)| (field.to_string(), keys));
        Ok(Self {
            predicate: cache.predicate(body)?,
            probe,
            members: HashSet::new(),
        })
    }

    fn candidates(&self, ctx: &mut StageContext<'_>) -> Option<BTreeSet<RowId>> {
        let (field, keys) = self.probe.as_ref()?;
        if !ctx.first_stage {
            return None;
        }
        Some(ctx.tables.dimension(field, ctx.upstream.rows()).find_in(keys))
    }
}

impl Operator for MatchOp {
    fn name(&self) -> &'static str {
        "$match"
    }

    fn on_add(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_add() {
            return Ok(Vec::new());
        }
        let Some(doc) = ctx.resolve(&delta.row) else {
            return Ok(Vec::new());
        };
        if (self.predicate)(&doc) {
            self.members.insert(delta.row.clone());
            return Ok(vec![delta.clone()]);
        }
        Ok(Vec::new())
    }

    fn on_remove(&mut self, delta: &Delta, _ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_remove() || !self.members.remove(&delta.row) {
            return Ok(Vec::new());
        }
        Ok(vec![delta.clone()])
    }

    fn snapshot(&mut self, input: Vec<RowKey>, ctx: &mut StageContext<'_>) -> Result<Vec<RowKey>> {
        self.members.clear();
        let candidates = self.candidates(ctx);
        let mut out = Vec::new();
        for row in input {
            if let Some(c) = &candidates {
                if !row.row_id().is_some_and(|id| c.contains(&id)) {
                    continue;
                }
            }
            let Some(doc) = ctx.resolve(&row) else {
                continue;
            };
            if (self.predicate)(&doc) {
                self.members.insert(row.clone());
                out.push(row);
            }
        }
        Ok(out)
    }

    fn active_rows(
        &mut self,
        input: Vec<RowKey>,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Vec<RowKey>> {
        Ok(input
            .into_iter()
            .filter(|row| self.members.contains(row))
            .collect())
    }

    fn effective_document(&self, row: &RowKey, upstream: &Resolver<'_>) -> Option<Arc<Value>> {
        upstream.resolve(row)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::incremental()
    }

    fn reset(&mut self, _tables: &mut SideTables) {
        self.members.clear();
    }
}
