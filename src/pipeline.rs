use std::cmp::Ordering;

use serde_json::Value;

use crate::document::resolve_field;
use crate::error::{Error, Result};
use crate::group::AccumulatorKind;
use crate::value::ValueKey;

// ---------------------------------------------------------------------------
// Sort keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

/// Compare two documents by sort keys. Missing fields sort as `null`: first
/// ascending, last descending.
pub fn compare_docs(keys: &[SortKey], a: &Value, b: &Value) -> Ordering {
    for key in keys {
        let av = ValueKey::from_json(&resolve_field(a, &key.field));
        let bv = ValueKey::from_json(&resolve_field(b, &key.field));
        let cmp = match key.order {
            SortOrder::Asc => av.cmp(&bv),
            SortOrder::Desc => bv.cmp(&av),
        };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

/// Pre-extracted sort values for one row, so sorting does not re-resolve
/// paths on every comparison.
pub fn sort_values(keys: &[SortKey], doc: &Value) -> Vec<ValueKey> {
    keys.iter()
        .map(|k| ValueKey::from_json(&resolve_field(doc, &k.field)))
        .collect()
}

pub fn compare_sort_values(keys: &[SortKey], a: &[ValueKey], b: &[ValueKey]) -> Ordering {
    for ((key, av), bv) in keys.iter().zip(a).zip(b) {
        let cmp = match key.order {
            SortOrder::Asc => av.cmp(bv),
            SortOrder::Desc => bv.cmp(av),
        };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

// ---------------------------------------------------------------------------
// Stage bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AccumulatorSpec {
    pub name: String,
    pub kind: AccumulatorKind,
    /// Source of the input expression.
    pub expr: Value,
}

#[derive(Debug, Clone)]
pub enum ProjectionField {
    Include,
    Exclude,
    Compute(Value),
}

#[derive(Debug, Clone)]
pub struct UnwindSpec {
    pub path: String,
    pub preserve_null_and_empty: bool,
    pub include_array_index: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Stage {
    Match(Value),
    Group {
        key: Value,
        accumulators: Vec<AccumulatorSpec>,
    },
    Sort(Vec<SortKey>),
    Skip(u64),
    Limit(u64),
    /// `$sort` immediately followed by `$limit`.
    TopK { keys: Vec<SortKey>, k: u64 },
    Project(Vec<(String, ProjectionField)>),
    AddFields(Vec<(String, Value)>),
    Unwind(UnwindSpec),
    Lookup(LookupSpec),
    Count(String),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Group { .. } => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::TopK { .. } => "$topK",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Unwind(_) => "$unwind",
            Stage::Lookup(_) => "$lookup",
            Stage::Count(_) => "$count",
        }
    }

    /// Output is a window over the upstream order.
    pub fn is_windowing(&self) -> bool {
        matches!(self, Stage::Limit(_) | Stage::Skip(_) | Stage::TopK { .. })
    }

    /// Emits rows in the group-key identifier space.
    pub fn is_aggregating(&self) -> bool {
        matches!(self, Stage::Group { .. } | Stage::Count(_) | Stage::TopK { .. })
    }

    /// Reorders its input.
    pub fn is_reordering(&self) -> bool {
        matches!(
            self,
            Stage::Sort(_) | Stage::TopK { .. } | Stage::Group { .. } | Stage::Count(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Stage parsing helpers
// ---------------------------------------------------------------------------

fn parse_accumulator(name: &str, val: &Value) -> Result<AccumulatorSpec> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline(format!("accumulator '{name}' must be an object")))?;
    let mut entries = obj.iter();
    let (op, arg) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(Error::InvalidPipeline(format!(
                "accumulator '{name}' must have exactly one operator"
            )))
        }
    };
    let kind = AccumulatorKind::from_name(op)
        .ok_or_else(|| Error::InvalidPipeline(format!("unknown accumulator: {op}")))?;
    let expr = match kind {
        AccumulatorKind::Count => Value::Null,
        _ => arg.clone(),
    };
    Ok(AccumulatorSpec {
        name: name.to_string(),
        kind,
        expr,
    })
}

fn parse_group_stage(val: &Value) -> Result<Stage> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$group must be an object".into()))?;

    let key = obj
        .get("_id")
        .ok_or_else(|| Error::InvalidPipeline("$group requires '_id' field".into()))?
        .clone();

    let mut accumulators = Vec::new();
    for (name, spec) in obj {
        if name == "_id" {
            continue;
        }
        if name.contains('.') {
            return Err(Error::InvalidPipeline(format!(
                "$group field '{name}' cannot contain '.'"
            )));
        }
        accumulators.push(parse_accumulator(name, spec)?);
    }

    Ok(Stage::Group { key, accumulators })
}

fn parse_sort(val: &Value) -> Result<Vec<SortKey>> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$sort must be an object".into()))?;
    if obj.is_empty() {
        return Err(Error::InvalidPipeline("$sort requires at least one key".into()));
    }
    let mut keys = Vec::new();
    for (field, dir) in obj {
        let order = match dir.as_i64() {
            Some(1) => SortOrder::Asc,
            Some(-1) => SortOrder::Desc,
            _ => {
                return Err(Error::InvalidPipeline(
                    "sort direction must be 1 or -1".into(),
                ))
            }
        };
        keys.push(SortKey {
            field: field.clone(),
            order,
        });
    }
    Ok(keys)
}

fn parse_project(val: &Value) -> Result<Vec<(String, ProjectionField)>> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$project must be an object".into()))?;
    let mut fields = Vec::new();
    for (field, spec) in obj {
        let pf = match spec {
            Value::Number(n) if n.as_f64() == Some(0.0) => ProjectionField::Exclude,
            Value::Number(_) | Value::Bool(true) => ProjectionField::Include,
            Value::Bool(false) => ProjectionField::Exclude,
            _ => ProjectionField::Compute(spec.clone()),
        };
        fields.push((field.clone(), pf));
    }
    let excludes = fields
        .iter()
        .any(|(name, pf)| name != "_id" && matches!(pf, ProjectionField::Exclude));
    let includes = fields
        .iter()
        .any(|(_, pf)| !matches!(pf, ProjectionField::Exclude));
    if excludes && includes {
        return Err(Error::InvalidPipeline(
            "$project cannot mix inclusion and exclusion".into(),
        ));
    }
    Ok(fields)
}

fn parse_unwind(val: &Value) -> Result<UnwindSpec> {
    let field_path = |s: &str| -> Result<String> {
        match s.strip_prefix('$') {
            Some(path) if !path.is_empty() => Ok(path.to_string()),
            _ => Err(Error::InvalidPipeline(
                "$unwind path must start with $".into(),
            )),
        }
    };
    match val {
        Value::String(s) => Ok(UnwindSpec {
            path: field_path(s)?,
            preserve_null_and_empty: false,
            include_array_index: None,
        }),
        Value::Object(obj) => {
            let path = obj
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidPipeline("$unwind requires 'path' string".into()))?;
            let preserve = match obj.get("preserveNullAndEmptyArrays") {
                None => false,
                Some(Value::Bool(b)) => *b,
                Some(_) => {
                    return Err(Error::InvalidPipeline(
                        "preserveNullAndEmptyArrays must be a boolean".into(),
                    ))
                }
            };
            let include_array_index = match obj.get("includeArrayIndex") {
                None => None,
                Some(Value::String(s)) if !s.is_empty() && !s.starts_with('$') => Some(s.clone()),
                Some(_) => {
                    return Err(Error::InvalidPipeline(
                        "includeArrayIndex must be a field name".into(),
                    ))
                }
            };
            Ok(UnwindSpec {
                path: field_path(path)?,
                preserve_null_and_empty: preserve,
                include_array_index,
            })
        }
        _ => Err(Error::InvalidPipeline(
            "$unwind must be a string or object".into(),
        )),
    }
}

fn parse_lookup(val: &Value) -> Result<LookupSpec> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidLookup("$lookup must be an object".into()))?;
    let field = |name: &str| -> Result<String> {
        obj.get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidLookup(format!("$lookup requires '{name}' string")))
    };
    Ok(LookupSpec {
        from: field("from")?,
        local_field: field("localField")?,
        foreign_field: field("foreignField")?,
        as_field: field("as")?,
    })
}

fn parse_count(val: &Value) -> Result<String> {
    match val.as_str() {
        Some(s) if !s.is_empty() && !s.starts_with('$') && !s.contains('.') => Ok(s.to_string()),
        _ => Err(Error::InvalidPipeline(
            "$count must be a non-empty field name".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    source: String,
}

impl Pipeline {
    pub fn parse(pipeline_json: &Value) -> Result<Self> {
        let arr = pipeline_json
            .as_array()
            .ok_or_else(|| Error::InvalidPipeline("pipeline must be an array".into()))?;

        let mut stages: Vec<Stage> = Vec::with_capacity(arr.len());
        for stage_val in arr {
            let obj = stage_val.as_object().ok_or_else(|| {
                Error::InvalidPipeline("each pipeline stage must be an object".into())
            })?;
            let mut entries = obj.iter();
            let (stage_name, stage_body) = match (entries.next(), entries.next()) {
                (Some(entry), None) => entry,
                _ => {
                    return Err(Error::InvalidPipeline(
                        "each pipeline stage must have exactly one key".into(),
                    ))
                }
            };

            let stage = match stage_name.as_str() {
                "$match" => {
                    if !stage_body.is_object() {
                        return Err(Error::InvalidPipeline("$match must be an object".into()));
                    }
                    Stage::Match(stage_body.clone())
                }
                "$group" => parse_group_stage(stage_body)?,
                "$sort" => Stage::Sort(parse_sort(stage_body)?),
                "$skip" => {
                    let n = stage_body.as_u64().ok_or_else(|| {
                        Error::InvalidPipeline("$skip must be a non-negative integer".into())
                    })?;
                    Stage::Skip(n)
                }
                "$limit" => {
                    let n = stage_body.as_u64().ok_or_else(|| {
                        Error::InvalidPipeline("$limit must be a non-negative integer".into())
                    })?;
                    match stages.pop() {
                        Some(Stage::Sort(keys)) => Stage::TopK { keys, k: n },
                        Some(prev) => {
                            stages.push(prev);
                            Stage::Limit(n)
                        }
                        None => Stage::Limit(n),
                    }
                }
                "$project" => Stage::Project(parse_project(stage_body)?),
                "$addFields" | "$set" => {
                    let obj = stage_body.as_object().ok_or_else(|| {
                        Error::InvalidPipeline(format!("{stage_name} must be an object"))
                    })?;
                    Stage::AddFields(obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                }
                "$unwind" => Stage::Unwind(parse_unwind(stage_body)?),
                "$lookup" => Stage::Lookup(parse_lookup(stage_body)?),
                "$count" => Stage::Count(parse_count(stage_body)?),
                other => return Err(Error::UnsupportedStage(other.to_string())),
            };
            stages.push(stage);
        }

        Ok(Pipeline {
            stages,
            source: pipeline_json.to_string(),
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Canonical text of the stage list, used as the plan cache key.
    pub fn source(&self) -> &str {
        &self.source
    }
}
