use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::{Capabilities, Operator, Resolver, StageContext};
use crate::compile::{ExprCache, ExprFn};
use crate::delta::{Delta, RowKey};
use crate::document::{get_path, remove_path, set_path};
use crate::error::Result;
use crate::pipeline::ProjectionField;
use crate::store::SideTables;

enum Field {
    Include,
    Exclude,
    Compute(ExprFn),
}

enum Transform {
    Project(Vec<(String, Field)>),
    AddFields(Vec<(String, ExprFn)>),
}

impl Transform {
    fn apply(&self, doc: &Value) -> Value {
        match self {
            Transform::Project(fields) => project(fields, doc),
            Transform::AddFields(fields) => {
                // Every expression sees the input document, not earlier outputs.
                let computed: Vec<Value> = fields.iter().map(|(_, f)| f(doc)).collect();
                let mut out = doc.clone();
                for ((name, _), value) in fields.iter().zip(computed) {
                    set_path(&mut out, name, value);
                }
                out
            }
        }
    }
}

fn project(fields: &[(String, Field)], doc: &Value) -> Value {
    let inclusion_mode = fields
        .iter()
        .any(|(name, f)| matches!(f, Field::Compute(_)) || (name != "_id" && matches!(f, Field::Include)));

    if !inclusion_mode {
        let mut out = doc.clone();
        for (name, _) in fields {
            remove_path(&mut out, name);
        }
        return out;
    }

    let mut out = Value::Object(Map::new());
    let id_excluded = fields
        .iter()
        .any(|(name, f)| name == "_id" && matches!(f, Field::Exclude));
    let id_listed = fields.iter().any(|(name, _)| name == "_id");
    if !id_excluded && !id_listed {
        if let Some(id) = doc.get("_id") {
            set_path(&mut out, "_id", id.clone());
        }
    }
    for (name, f) in fields {
        match f {
            Field::Include => {
                if let Some(v) = get_path(doc, name) {
                    set_path(&mut out, name, v.clone());
                }
            }
            Field::Compute(expr) => set_path(&mut out, name, expr(doc)),
            Field::Exclude => {}
        }
    }
    out
}

/// `$project` and `$addFields`: caches each row's transformed document.
pub struct ProjectOp {
    name: &'static str,
    transform: Transform,
    cache: HashMap<RowKey, Arc<Value>>,
}

impl ProjectOp {
    pub fn project(fields: &[(String, ProjectionField)], cache: &mut ExprCache) -> Self {
        let fields = fields
            .iter()
            .map(|(name, pf)| {
                let f = match pf {
                    ProjectionField::Include => Field::Include,
                    ProjectionField::Exclude => Field::Exclude,
                    ProjectionField::Compute(src) => Field::Compute(cache.expression(src)),
                };
                (name.clone(), f)
            })
            .collect();
        Self {
            name: "$project",
            transform: Transform::Project(fields),
            cache: HashMap::new(),
        }
    }

    pub fn add_fields(fields: &[(String, Value)], cache: &mut ExprCache) -> Self {
        let fields = fields
            .iter()
            .map(|(name, src)| (name.clone(), cache.expression(src)))
            .collect();
        Self {
            name: "$addFields",
            transform: Transform::AddFields(fields),
            cache: HashMap::new(),
        }
    }

    fn compute(&mut self, row: &RowKey, ctx: &StageContext<'_>) -> bool {
        match ctx.resolve(row) {
            Some(doc) => {
                let out = Arc::new(self.transform.apply(&doc));
                self.cache.insert(row.clone(), out);
                true
            }
            None => false,
        }
    }
}

impl Operator for ProjectOp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn on_add(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_add() || !self.compute(&delta.row, ctx) {
            return Ok(Vec::new());
        }
        Ok(vec![delta.clone()])
    }

    fn on_remove(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_remove() {
            return Ok(Vec::new());
        }
        let evicted = self.cache.remove(&delta.row).is_some();
        ctx.check(evicted, || format!("{}: removal of unknown {}", self.name, delta.row))?;
        Ok(if evicted { vec![delta.clone()] } else { Vec::new() })
    }

    fn snapshot(&mut self, input: Vec<RowKey>, ctx: &mut StageContext<'_>) -> Result<Vec<RowKey>> {
        self.cache.clear();
        Ok(input
            .into_iter()
            .filter(|row| self.compute(row, ctx))
            .collect())
    }

    fn active_rows(
        &mut self,
        input: Vec<RowKey>,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Vec<RowKey>> {
        Ok(input
            .into_iter()
            .filter(|row| self.cache.contains_key(row))
            .collect())
    }

    fn effective_document(&self, row: &RowKey, _upstream: &Resolver<'_>) -> Option<Arc<Value>> {
        self.cache.get(row).cloned()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::incremental()
    }

    fn reset(&mut self, _tables: &mut SideTables) {
        self.cache.clear();
    }
}
