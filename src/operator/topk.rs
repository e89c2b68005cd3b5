use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;

use super::{Capabilities, Operator, Resolver, StageContext};
use crate::delta::{Delta, RowKey};
use crate::error::Result;
use crate::pipeline::{sort_values, SortKey, SortOrder};
use crate::store::SideTables;
use crate::value::ValueKey;

/// A row with its sort values, ordered best first. Ties break by row key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Ranked {
    values: Vec<(SortOrder, ValueKey)>,
    row: RowKey,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((order, a), (_, b)) in self.values.iter().zip(&other.values) {
            let cmp = match order {
                SortOrder::Asc => a.cmp(b),
                SortOrder::Desc => b.cmp(a),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        self.row.cmp(&other.row)
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `$sort` + `$limit`: a bounded best-k set. Losing a member of a full set
/// marks the set for a rescan, which runs lazily at materialization.
pub struct TopKOp {
    keys: Vec<SortKey>,
    k: usize,
    best: BTreeSet<Ranked>,
    members: HashMap<RowKey, Ranked>,
    rescan: bool,
}

impl TopKOp {
    pub fn new(keys: Vec<SortKey>, k: u64) -> Self {
        Self {
            keys,
            k: usize::try_from(k).unwrap_or(usize::MAX),
            best: BTreeSet::new(),
            members: HashMap::new(),
            rescan: false,
        }
    }

    fn rank(&self, row: RowKey, doc: &Value) -> Ranked {
        let values = sort_values(&self.keys, doc);
        Ranked {
            values: self.keys.iter().map(|k| k.order).zip(values).collect(),
            row,
        }
    }

    fn insert(&mut self, ranked: Ranked) {
        self.members.insert(ranked.row.clone(), ranked.clone());
        self.best.insert(ranked);
    }

    fn rebuild(&mut self, input: &[RowKey], ctx: &StageContext<'_>) {
        self.best.clear();
        self.members.clear();
        let mut all: Vec<Ranked> = input
            .iter()
            .filter_map(|row| {
                let doc = ctx.resolve(row)?;
                Some(self.rank(row.clone(), &doc))
            })
            .collect();
        all.sort();
        all.truncate(self.k);
        for ranked in all {
            self.insert(ranked);
        }
        self.rescan = false;
    }

    fn listing(&self) -> Vec<RowKey> {
        self.best.iter().map(|r| r.row.clone()).collect()
    }
}

impl Operator for TopKOp {
    fn name(&self) -> &'static str {
        "$topK"
    }

    fn on_add(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_add() {
            return Ok(Vec::new());
        }
        if !self.rescan && self.k > 0 {
            if let Some(doc) = ctx.resolve(&delta.row) {
                let ranked = self.rank(delta.row.clone(), &doc);
                let admit = self.best.len() < self.k
                    || self.best.last().is_some_and(|worst| ranked < *worst);
                if admit {
                    self.insert(ranked);
                    if self.best.len() > self.k {
                        if let Some(evicted) = self.best.pop_last() {
                            self.members.remove(&evicted.row);
                        }
                    }
                }
            }
        }
        Ok(vec![delta.clone()])
    }

    fn on_remove(&mut self, delta: &Delta, _ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_remove() {
            return Ok(Vec::new());
        }
        if let Some(ranked) = self.members.remove(&delta.row) {
            let was_full = self.best.len() == self.k;
            self.best.remove(&ranked);
            // A full set may have displaced rows that now belong in it.
            if was_full {
                self.rescan = true;
            }
        }
        Ok(vec![delta.clone()])
    }

    fn snapshot(&mut self, input: Vec<RowKey>, ctx: &mut StageContext<'_>) -> Result<Vec<RowKey>> {
        self.rebuild(&input, ctx);
        Ok(self.listing())
    }

    fn active_rows(
        &mut self,
        input: Vec<RowKey>,
        ctx: &mut StageContext<'_>,
    ) -> Result<Vec<RowKey>> {
        if self.rescan {
            self.rebuild(&input, ctx);
        }
        Ok(self.listing())
    }

    fn effective_document(&self, row: &RowKey, upstream: &Resolver<'_>) -> Option<Arc<Value>> {
        upstream.resolve(row)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            aggregates: true,
            order_sensitive: true,
            ..Capabilities::incremental()
        }
    }

    fn reset(&mut self, _tables: &mut SideTables) {
        self.best.clear();
        self.members.clear();
        self.rescan = false;
    }
}
