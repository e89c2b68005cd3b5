use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;

use super::{Capabilities, Operator, Resolver, StageContext};
use crate::delta::{Delta, RowKey};
use crate::document::{get_path, set_path};
use crate::error::Result;
use crate::pipeline::LookupSpec;
use crate::store::SideTables;
use crate::value::ValueKey;

/// Encoded keys a field value matches under: the whole value, plus each
/// element when it is an array. A missing field matches as null.
fn match_keys(value: Option<&Value>) -> Vec<String> {
    match value {
        None => vec![ValueKey::Null.encode()],
        Some(whole @ Value::Array(items)) => {
            let mut keys = vec![ValueKey::from_json(whole).encode()];
            keys.extend(items.iter().map(|item| ValueKey::from_json(item).encode()));
            keys
        }
        Some(v) => vec![ValueKey::from_json(v).encode()],
    }
}

/// `$lookup` against a static foreign collection indexed at construction.
/// Rows pass through; the joined array is attached when the row resolves.
pub struct LookupOp {
    spec: LookupSpec,
    foreign: Vec<Arc<Value>>,
    index: HashMap<String, Vec<usize>>,
}

impl LookupOp {
    pub fn new(spec: LookupSpec, foreign: &[Arc<Value>]) -> Self {
        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (pos, doc) in foreign.iter().enumerate() {
            let mut keys = match_keys(get_path(doc, &spec.foreign_field));
            keys.sort();
            keys.dedup();
            for key in keys {
                index.entry(key).or_default().push(pos);
            }
        }
        Self {
            spec,
            foreign: foreign.to_vec(),
            index,
        }
    }

    /// Foreign documents matching `doc`, in foreign collection order.
    fn joined(&self, doc: &Value) -> Value {
        let positions: BTreeSet<usize> = match_keys(get_path(doc, &self.spec.local_field))
            .iter()
            .filter_map(|key| self.index.get(key))
            .flatten()
            .copied()
            .collect();
        Value::Array(
            positions
                .into_iter()
                .map(|pos| self.foreign[pos].as_ref().clone())
                .collect(),
        )
    }
}

impl Operator for LookupOp {
    fn name(&self) -> &'static str {
        "$lookup"
    }

    fn on_add(&mut self, delta: &Delta, _ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        Ok(if delta.is_add() { vec![delta.clone()] } else { Vec::new() })
    }

    fn on_remove(&mut self, delta: &Delta, _ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        Ok(if delta.is_remove() { vec![delta.clone()] } else { Vec::new() })
    }

    fn snapshot(&mut self, input: Vec<RowKey>, _ctx: &mut StageContext<'_>) -> Result<Vec<RowKey>> {
        Ok(input)
    }

    fn active_rows(
        &mut self,
        input: Vec<RowKey>,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Vec<RowKey>> {
        Ok(input)
    }

    fn effective_document(&self, row: &RowKey, upstream: &Resolver<'_>) -> Option<Arc<Value>> {
        let doc = upstream.resolve(row)?;
        let joined = self.joined(&doc);
        let mut out = doc.as_ref().clone();
        set_path(&mut out, &self.spec.as_field, joined);
        Some(Arc::new(out))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::incremental()
    }

    fn reset(&mut self, _tables: &mut SideTables) {}
}
