use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::{Capabilities, Operator, Resolver, StageContext};
use crate::delta::{Delta, RowKey};
use crate::document::{get_path, set_path, RowId};
use crate::error::Result;
use crate::pipeline::UnwindSpec;
use crate::store::SideTables;

/// What a child writes at the unwound path.
#[derive(Debug, Clone)]
enum Element {
    Value(Value),
    /// Empty array under `preserveNullAndEmptyArrays`.
    Null,
    /// Null, missing or scalar field: the parent document as-is.
    Unchanged,
}

#[derive(Debug, Clone)]
struct VirtualRow {
    parent: RowKey,
    index: Option<usize>,
    element: Element,
}

#[derive(Debug, Clone)]
struct Expansion {
    /// Field value the children were synthesized from.
    source: Option<Value>,
    children: Vec<RowId>,
}

/// `$unwind`: one virtual row per array element. Children are stored as
/// parent reference plus path override and materialized on demand.
pub struct UnwindOp {
    spec: UnwindSpec,
    expansions: HashMap<RowKey, Expansion>,
    virtuals: HashMap<RowId, VirtualRow>,
}

impl UnwindOp {
    pub fn new(spec: UnwindSpec) -> Self {
        Self {
            spec,
            expansions: HashMap::new(),
            virtuals: HashMap::new(),
        }
    }

    fn elements(&self, source: Option<&Value>) -> Vec<(Option<usize>, Element)> {
        let preserve = self.spec.preserve_null_and_empty;
        match source {
            Some(Value::Array(items)) if items.is_empty() => {
                if preserve {
                    vec![(None, Element::Null)]
                } else {
                    Vec::new()
                }
            }
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| (Some(i), Element::Value(item.clone())))
                .collect(),
            None | Some(Value::Null) => {
                if preserve {
                    vec![(None, Element::Unchanged)]
                } else {
                    Vec::new()
                }
            }
            Some(_) => vec![(None, Element::Unchanged)],
        }
    }

    /// Synthesize children for `parent`, recording both mappings.
    fn expand(
        &mut self,
        parent: &RowKey,
        doc: &Value,
        tables: &mut SideTables,
    ) -> Vec<RowId> {
        let source = get_path(doc, &self.spec.path);
        let mut children = Vec::new();
        for (index, element) in self.elements(source) {
            let id = tables.allocate_virtual();
            self.virtuals.insert(
                id,
                VirtualRow {
                    parent: parent.clone(),
                    index,
                    element,
                },
            );
            children.push(id);
        }
        self.expansions.insert(
            parent.clone(),
            Expansion {
                source: source.cloned(),
                children: children.clone(),
            },
        );
        children
    }

    /// Drop every child of `parent`; `None` when it was never expanded.
    fn collapse(&mut self, parent: &RowKey) -> Option<Vec<RowId>> {
        let expansion = self.expansions.remove(parent)?;
        for id in &expansion.children {
            self.virtuals.remove(id);
        }
        Some(expansion.children)
    }

    fn children_of<'s>(&'s self, input: &'s [RowKey]) -> impl Iterator<Item = RowKey> + 's {
        input
            .iter()
            .filter_map(|row| self.expansions.get(row))
            .flat_map(|e| e.children.iter().map(|id| RowKey::Row(*id)))
    }
}

impl Operator for UnwindOp {
    fn name(&self) -> &'static str {
        "$unwind"
    }

    fn on_add(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_add() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        if self.expansions.contains_key(&delta.row) {
            ctx.check(false, || format!("$unwind: {} added twice", delta.row))?;
            out = self.on_remove(&Delta::remove(delta.row.clone()), ctx)?;
        }
        let Some(doc) = ctx.resolve(&delta.row) else {
            return Ok(out);
        };
        let children = self.expand(&delta.row, &doc, ctx.tables);
        out.extend(children.into_iter().map(Delta::insert));
        Ok(out)
    }

    fn on_remove(&mut self, delta: &Delta, ctx: &mut StageContext<'_>) -> Result<Vec<Delta>> {
        if !delta.is_remove() {
            return Ok(Vec::new());
        }
        let Some(children) = self.collapse(&delta.row) else {
            ctx.check(false, || format!("$unwind: removal of unknown {}", delta.row))?;
            return Ok(Vec::new());
        };
        Ok(children.into_iter().map(Delta::delete).collect())
    }

    fn snapshot(&mut self, input: Vec<RowKey>, ctx: &mut StageContext<'_>) -> Result<Vec<RowKey>> {
        let mut previous = std::mem::take(&mut self.expansions);
        let mut out = Vec::new();
        for row in &input {
            let Some(doc) = ctx.resolve(row) else {
                continue;
            };
            let source = get_path(&doc, &self.spec.path);
            // Keep the existing children while the array is unchanged.
            if let Some(expansion) = previous.remove(row) {
                if expansion.source.as_ref() == source {
                    out.extend(expansion.children.iter().map(|id| RowKey::Row(*id)));
                    self.expansions.insert(row.clone(), expansion);
                    continue;
                }
                for id in &expansion.children {
                    self.virtuals.remove(id);
                }
            }
            let children = self.expand(row, &doc, ctx.tables);
            out.extend(children.into_iter().map(RowKey::Row));
        }
        for expansion in previous.into_values() {
            for id in &expansion.children {
                self.virtuals.remove(id);
            }
        }
        Ok(out)
    }

    fn active_rows(
        &mut self,
        input: Vec<RowKey>,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Vec<RowKey>> {
        Ok(self.children_of(&input).collect())
    }

    fn effective_document(&self, row: &RowKey, upstream: &Resolver<'_>) -> Option<Arc<Value>> {
        let child = self.virtuals.get(&row.row_id()?)?;
        let mut doc = upstream.resolve(&child.parent)?.as_ref().clone();
        match &child.element {
            Element::Value(v) => set_path(&mut doc, &self.spec.path, v.clone()),
            Element::Null => set_path(&mut doc, &self.spec.path, Value::Null),
            Element::Unchanged => {}
        }
        if let Some(field) = &self.spec.include_array_index {
            let index = child.index.map_or(Value::Null, |i| Value::from(i as u64));
            set_path(&mut doc, field, index);
        }
        Some(Arc::new(doc))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            expands: true,
            ..Capabilities::incremental()
        }
    }

    fn reset(&mut self, _tables: &mut SideTables) {
        self.expansions.clear();
        self.virtuals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(preserve: bool) -> UnwindOp {
        UnwindOp::new(UnwindSpec {
            path: "tags".into(),
            preserve_null_and_empty: preserve,
            include_array_index: Some("i".into()),
        })
    }

    #[test]
    fn element_shapes() {
        let strict = op(false);
        assert_eq!(strict.elements(Some(&json!([1, 2, 3]))).len(), 3);
        assert!(strict.elements(Some(&json!([]))).is_empty());
        assert!(strict.elements(None).is_empty());
        assert!(strict.elements(Some(&Value::Null)).is_empty());
        assert!(matches!(
            strict.elements(Some(&json!("x"))).as_slice(),
            [(None, Element::Unchanged)]
        ));

        let preserve = op(true);
        assert!(matches!(
            preserve.elements(Some(&json!([]))).as_slice(),
            [(None, Element::Null)]
        ));
        assert!(matches!(
            preserve.elements(None).as_slice(),
            [(None, Element::Unchanged)]
        ));
    }

    #[test]
    fn expand_and_collapse_keep_mappings_in_step() {
        let mut unwind = op(false);
        let mut tables = SideTables::default();
        let parent = RowKey::Row(0);
        let children = unwind.expand(&parent, &json!({"tags": ["a", "b"]}), &mut tables);
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|id| crate::document::is_virtual(*id)));
        assert_eq!(unwind.virtuals.len(), 2);

        assert_eq!(unwind.collapse(&parent), Some(children));
        assert!(unwind.virtuals.is_empty());
        assert!(unwind.collapse(&parent).is_none());
    }
}
