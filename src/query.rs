use regex::{Regex, RegexBuilder};
use serde_json::Value as JsonValue;

use crate::document::get_path;
use crate::error::{Error, Result};
use crate::expr::{is_truthy, parse_expression, Expr};
use crate::value::ValueKey;

// ---------------------------------------------------------------------------
// Query AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RegexSpec {
    pub pattern: String,
    pub options: String,
}

impl RegexSpec {
    /// Build the regex honouring the `i`, `m`, `s` and `x` options.
    pub fn build(&self) -> Option<Regex> {
        RegexBuilder::new(&self.pattern)
            .case_insensitive(self.options.contains('i'))
            .multi_line(self.options.contains('m'))
            .dot_matches_new_line(self.options.contains('s'))
            .ignore_whitespace(self.options.contains('x'))
            .build()
            .ok()
    }
}

#[derive(Debug, Clone)]
pub enum QueryOp {
    Eq(ValueKey),
    Ne(ValueKey),
    Gt(ValueKey),
    Gte(ValueKey),
    Lt(ValueKey),
    Lte(ValueKey),
    In(Vec<ValueKey>),
    Nin(Vec<ValueKey>),
    Exists(bool),
    Size(usize),
    All(Vec<ValueKey>),
    Regex(RegexSpec),
    /// `$elemMatch` whose body is a sub-query over element documents.
    ElemMatch(Box<Query>),
    /// `$elemMatch` whose body is operators applied to each element itself.
    ElemMatchOps(Vec<QueryOp>),
    Not(Vec<QueryOp>),
    Invalid(String),
}

#[derive(Debug, Clone)]
pub enum Query {
    Field { field: String, op: QueryOp },
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
    Expr(Expr),
    All, // match everything
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Parsing: JSON → Query AST
// ---------------------------------------------------------------------------

/// Parse a `$match` body. Only a non-object body is an error; unknown
/// operators become `Invalid` nodes that match nothing.
pub fn parse_query(query: &JsonValue) -> Result<Query> {
    let obj = query
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$match must be a JSON object".into()))?;
    Ok(parse_query_object(obj))
}

fn parse_query_object(obj: &serde_json::Map<String, JsonValue>) -> Query {
    if obj.is_empty() {
        return Query::All;
    }

    let mut conditions: Vec<Query> = Vec::new();

    for (key, value) in obj {
        match key.as_str() {
            "$and" => conditions.push(parse_logical(value, "$and", Query::And)),
            "$or" => conditions.push(parse_logical(value, "$or", Query::Or)),
            "$nor" => conditions.push(parse_logical(value, "$nor", Query::Nor)),
            "$expr" => conditions.push(Query::Expr(parse_expression(value))),
            op if op.starts_with('$') => {
                conditions.push(Query::Invalid(format!("unknown top-level operator: {op}")))
            }
            field => match value.as_object() {
                // Operator object: {"age": {"$gte": 18, "$lt": 65}}
                Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    for op in parse_ops(ops) {
                        conditions.push(Query::Field {
                            field: field.to_string(),
                            op,
                        });
                    }
                }
                // Shorthand for $eq, including plain object equality
                _ => conditions.push(Query::Field {
                    field: field.to_string(),
                    op: QueryOp::Eq(ValueKey::from_json(value)),
                }),
            },
        }
    }

    if conditions.len() == 1 {
        conditions.remove(0)
    } else {
        Query::And(conditions)
    }
}

fn parse_logical(value: &JsonValue, name: &str, build: fn(Vec<Query>) -> Query) -> Query {
    let Some(arr) = value.as_array() else {
        return Query::Invalid(format!("{name} must be an array"));
    };
    let mut subs = Vec::with_capacity(arr.len());
    for sub in arr {
        match sub.as_object() {
            Some(obj) => subs.push(parse_query_object(obj)),
            None => return Query::Invalid(format!("{name} entries must be objects")),
        }
    }
    build(subs)
}

fn parse_ops(ops: &serde_json::Map<String, JsonValue>) -> Vec<QueryOp> {
    let options = ops
        .get("$options")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    ops.iter()
        .filter(|(k, _)| k.as_str() != "$options")
        .map(|(k, v)| parse_op(k, v, options))
        .collect()
}

fn parse_op(op_key: &str, op_val: &JsonValue, options: &str) -> QueryOp {
    match op_key {
        "$eq" => QueryOp::Eq(ValueKey::from_json(op_val)),
        "$ne" => QueryOp::Ne(ValueKey::from_json(op_val)),
        "$gt" => QueryOp::Gt(ValueKey::from_json(op_val)),
        "$gte" => QueryOp::Gte(ValueKey::from_json(op_val)),
        "$lt" => QueryOp::Lt(ValueKey::from_json(op_val)),
        "$lte" => QueryOp::Lte(ValueKey::from_json(op_val)),
        "$in" | "$nin" | "$all" => {
            let Some(arr) = op_val.as_array() else {
                return QueryOp::Invalid(format!("{op_key} must be an array"));
            };
            let keys = arr.iter().map(ValueKey::from_json).collect();
            match op_key {
                "$in" => QueryOp::In(keys),
                "$nin" => QueryOp::Nin(keys),
                _ => QueryOp::All(keys),
            }
        }
        "$exists" => match op_val {
            JsonValue::Bool(b) => QueryOp::Exists(*b),
            JsonValue::Number(n) => QueryOp::Exists(n.as_f64() != Some(0.0)),
            _ => QueryOp::Invalid("$exists must be a boolean".into()),
        },
        "$size" => match op_val.as_u64() {
            Some(n) => QueryOp::Size(n as usize),
            None => QueryOp::Invalid("$size must be a non-negative integer".into()),
        },
        "$regex" => match op_val.as_str() {
            Some(pattern) => QueryOp::Regex(RegexSpec {
                pattern: pattern.to_string(),
                options: options.to_string(),
            }),
            None => QueryOp::Invalid("$regex must be a string".into()),
        },
        "$elemMatch" => {
            let Some(body) = op_val.as_object() else {
                return QueryOp::Invalid("$elemMatch must be an object".into());
            };
            let operator_body = !body.is_empty()
                && body
                    .keys()
                    .all(|k| k.starts_with('$') && !matches!(k.as_str(), "$and" | "$or" | "$nor" | "$expr"));
            if operator_body {
                QueryOp::ElemMatchOps(parse_ops(body))
            } else {
                QueryOp::ElemMatch(Box::new(parse_query_object(body)))
            }
        }
        "$not" => match op_val {
            JsonValue::Object(body) if !body.is_empty() => QueryOp::Not(parse_ops(body)),
            JsonValue::String(pattern) => QueryOp::Not(vec![QueryOp::Regex(RegexSpec {
                pattern: pattern.clone(),
                options: options.to_string(),
            })]),
            _ => QueryOp::Invalid("$not must be an operator object".into()),
        },
        _ => QueryOp::Invalid(format!("unknown operator: {op_key}")),
    }
}

// ---------------------------------------------------------------------------
// Filter: evaluate a query against a single document
// ---------------------------------------------------------------------------

impl Query {
    pub fn matches(&self, data: &JsonValue) -> bool {
        match self {
            Query::All => true,
            Query::Field { field, op } => op.matches(get_path(data, field)),
            Query::And(subs) => subs.iter().all(|s| s.matches(data)),
            Query::Or(subs) => subs.iter().any(|s| s.matches(data)),
            Query::Nor(subs) => !subs.iter().any(|s| s.matches(data)),
            Query::Expr(expr) => is_truthy(&expr.eval(data)),
            Query::Invalid(_) => false,
        }
    }

    /// `(field, keys)` when every matching row must carry one of `keys` in
    /// `field`, so a dimension lookup yields a candidate superset.
    pub fn equality_probe(&self) -> Option<(&str, Vec<ValueKey>)> {
        match self {
            Query::Field {
                field,
                op: QueryOp::Eq(v),
            } if is_probe_key(v) => Some((field, vec![v.clone()])),
            Query::Field {
                field,
                op: QueryOp::In(vals),
            } if vals.iter().all(is_probe_key) => Some((field, vals.clone())),
            Query::And(subs) => subs.iter().find_map(Query::equality_probe),
            _ => None,
        }
    }
}

fn is_probe_key(key: &ValueKey) -> bool {
    !matches!(key, ValueKey::Null | ValueKey::Array(_) | ValueKey::Document(_))
}

impl QueryOp {
    /// Match a resolved field value (`None` when the field is missing).
    pub fn matches(&self, value: Option<&JsonValue>) -> bool {
        match self {
            QueryOp::Regex(spec) => match spec.build() {
                Some(re) => regex_matches(&re, value),
                None => false,
            },
            QueryOp::Not(ops) => !ops.iter().all(|op| op.matches(value)),
            QueryOp::ElemMatchOps(ops) => elements(value)
                .iter()
                .any(|el| ops.iter().all(|op| op.matches(Some(el)))),
            _ => self.matches_plain(value),
        }
    }

    /// Every operator except the ones that carry a regex or nested operator
    /// list. Shared with the compiled closures.
    pub fn matches_plain(&self, value: Option<&JsonValue>) -> bool {
        match self {
            QueryOp::Eq(v) => eq_matches(v, value),
            QueryOp::Ne(v) => !eq_matches(v, value),
            QueryOp::Gt(v) => cmp_matches(v, value, |o| o.is_gt()),
            QueryOp::Gte(v) => cmp_matches(v, value, |o| o.is_ge()),
            QueryOp::Lt(v) => cmp_matches(v, value, |o| o.is_lt()),
            QueryOp::Lte(v) => cmp_matches(v, value, |o| o.is_le()),
            QueryOp::In(vals) => vals.iter().any(|v| eq_matches(v, value)),
            QueryOp::Nin(vals) => !vals.iter().any(|v| eq_matches(v, value)),
            QueryOp::Exists(expected) => value.is_some() == *expected,
            QueryOp::Size(n) => matches!(value, Some(JsonValue::Array(items)) if items.len() == *n),
            QueryOp::All(vals) => {
                !vals.is_empty() && vals.iter().all(|v| eq_matches(v, value))
            }
            QueryOp::ElemMatch(query) => elements(value).iter().any(|el| query.matches(el)),
            QueryOp::Regex(_) | QueryOp::Not(_) | QueryOp::ElemMatchOps(_) => self.matches(value),
            QueryOp::Invalid(_) => false,
        }
    }
}

/// Elements of an array field; empty for anything else.
fn elements(value: Option<&JsonValue>) -> &[JsonValue] {
    match value {
        Some(JsonValue::Array(items)) => items,
        _ => &[],
    }
}

/// Equality with document-query semantics: a missing field equals `null`,
/// and an array field matches when the whole array or any element is equal.
fn eq_matches(expected: &ValueKey, value: Option<&JsonValue>) -> bool {
    let Some(value) = value else {
        return matches!(expected, ValueKey::Null);
    };
    if ValueKey::from_json(value) == *expected {
        return true;
    }
    match value {
        JsonValue::Array(items) => items.iter().any(|el| ValueKey::from_json(el) == *expected),
        _ => false,
    }
}

/// Range comparison restricted to values of the same type class.
fn cmp_matches(
    bound: &ValueKey,
    value: Option<&JsonValue>,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    let Some(value) = value else {
        return matches!(bound, ValueKey::Null) && accept(std::cmp::Ordering::Equal);
    };
    let check = |v: &JsonValue| {
        let key = ValueKey::from_json(v);
        same_class(&key, bound) && accept(key.cmp(bound))
    };
    if check(value) {
        return true;
    }
    match value {
        JsonValue::Array(items) => items.iter().any(check),
        _ => false,
    }
}

fn same_class(a: &ValueKey, b: &ValueKey) -> bool {
    fn class(k: &ValueKey) -> u8 {
        match k {
            ValueKey::Null => 0,
            ValueKey::Boolean(_) => 1,
            ValueKey::Integer(_) | ValueKey::Float(_) => 2,
            ValueKey::DateTime(_) => 3,
            ValueKey::String(_) => 4,
            ValueKey::Document(_) => 5,
            ValueKey::Array(_) => 6,
        }
    }
    class(a) == class(b)
}

pub fn regex_matches(re: &Regex, value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::String(s)) => re.is_match(s),
        Some(JsonValue::Array(items)) => items
            .iter()
            .any(|el| el.as_str().is_some_and(|s| re.is_match(s))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(query: JsonValue, doc: JsonValue) -> bool {
        parse_query(&query).unwrap().matches(&doc)
    }

    #[test]
    fn parse_simple_eq() {
        assert!(check(json!({"name": "Alice"}), json!({"name": "Alice"})));
        assert!(!check(json!({"name": "Alice"}), json!({"name": "Bob"})));
    }

    #[test]
    fn parse_range() {
        let q = json!({"age": {"$gte": 18, "$lt": 65}});
        assert!(check(q.clone(), json!({"age": 30})));
        assert!(!check(q.clone(), json!({"age": 10})));
        assert!(!check(q, json!({"age": 70})));
    }

    #[test]
    fn parse_date_range() {
        let q = json!({"created_at": {"$gte": "2024-01-01", "$lt": "2025-01-01"}});
        assert!(check(q.clone(), json!({"created_at": "2024-06-15"})));
        assert!(!check(q, json!({"created_at": "2023-06-15"})));
    }

    #[test]
    fn parse_or_and_nor() {
        let q = json!({"$or": [{"status": "active"}, {"priority": {"$gte": 5}}]});
        assert!(check(q.clone(), json!({"status": "active", "priority": 1})));
        assert!(check(q.clone(), json!({"status": "closed", "priority": 10})));
        assert!(!check(q, json!({"status": "closed", "priority": 1})));

        let q = json!({"$nor": [{"a": 1}, {"b": 2}]});
        assert!(check(q.clone(), json!({"a": 3, "b": 3})));
        assert!(!check(q, json!({"a": 1})));
    }

    #[test]
    fn range_does_not_cross_types() {
        assert!(!check(json!({"v": {"$gte": 6}}), json!({"v": "abc"})));
        assert!(!check(json!({"v": {"$lt": 6}}), json!({"v": null})));
        assert!(!check(json!({"v": {"$gt": 1}}), json!({})));
    }

    #[test]
    fn array_fields_match_elements() {
        let doc = json!({"tags": ["red", "blue"], "scores": [3, 9]});
        assert!(check(json!({"tags": "blue"}), doc.clone()));
        assert!(check(json!({"tags": ["red", "blue"]}), doc.clone()));
        assert!(check(json!({"scores": {"$gt": 8}}), doc.clone()));
        assert!(!check(json!({"scores": {"$gt": 10}}), doc.clone()));
        assert!(check(json!({"tags": {"$all": ["blue", "red"]}}), doc.clone()));
        assert!(!check(json!({"tags": {"$all": ["blue", "green"]}}), doc.clone()));
        assert!(check(json!({"tags": {"$size": 2}}), doc.clone()));
        assert!(check(json!({"tags": {"$nin": ["green"]}}), doc));
    }

    #[test]
    fn missing_field_semantics() {
        assert!(check(json!({"x": null}), json!({})));
        assert!(check(json!({"x": {"$ne": 1}}), json!({})));
        assert!(check(json!({"x": {"$exists": false}}), json!({})));
        assert!(!check(json!({"x": {"$exists": true}}), json!({})));
        assert!(check(json!({"x": {"$in": [null, 1]}}), json!({})));
    }

    #[test]
    fn regex_with_options() {
        let q = json!({"name": {"$regex": "^al", "$options": "i"}});
        assert!(check(q.clone(), json!({"name": "Alice"})));
        assert!(!check(q, json!({"name": "Bob"})));
        assert!(!check(json!({"name": {"$regex": "("}}), json!({"name": "("})));
    }

    #[test]
    fn not_negates_operators() {
        let q = json!({"price": {"$not": {"$gt": 100}}});
        assert!(check(q.clone(), json!({"price": 50})));
        assert!(check(q.clone(), json!({})));
        assert!(!check(q, json!({"price": 150})));
    }

    #[test]
    fn elem_match_documents_and_scalars() {
        let doc = json!({"items": [{"sku": "a", "qty": 1}, {"sku": "b", "qty": 9}], "xs": [1, 82]});
        assert!(check(json!({"items": {"$elemMatch": {"sku": "b", "qty": {"$gt": 5}}}}), doc.clone()));
        assert!(!check(json!({"items": {"$elemMatch": {"sku": "a", "qty": {"$gt": 5}}}}), doc.clone()));
        assert!(check(json!({"xs": {"$elemMatch": {"$gte": 80, "$lt": 85}}}), doc));
    }

    #[test]
    fn expr_compares_fields() {
        let q = json!({"$expr": {"$gt": ["$spent", "$budget"]}});
        assert!(check(q.clone(), json!({"spent": 120, "budget": 100})));
        assert!(!check(q, json!({"spent": 80, "budget": 100})));
    }

    #[test]
    fn unknown_operator_matches_nothing() {
        assert!(!check(json!({"a": {"$bogus": 1}}), json!({"a": 1})));
        assert!(!check(json!({"$where": "x"}), json!({"a": 1})));
        assert!(parse_query(&json!([1])).is_err());
    }

    #[test]
    fn probe_extraction() {
        let q = parse_query(&json!({"status": "A", "qty": {"$gt": 1}})).unwrap();
        let (field, keys) = q.equality_probe().unwrap();
        assert_eq!(field, "status");
        assert_eq!(keys, vec![ValueKey::String("A".into())]);
        let q = parse_query(&json!({"status": null})).unwrap();
        assert!(q.equality_probe().is_none());
    }
}
