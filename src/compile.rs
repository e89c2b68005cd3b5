//! Closure-tree compilation for queries and expressions.
//!
//! `compile_expr` and `compile_query` turn a parsed AST into nested closures
//! with field paths pre-split, regexes pre-built and literal comparison
//! operands pre-converted. Anything the compiler rejects is served by a
//! closure wrapping the interpreter, so callers always get a function.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;
use crate::expr::{apply, date_to_string, is_truthy, parse_expression, Expr, Op};
use crate::query::{parse_query, regex_matches, Query, QueryOp};
use crate::value::ValueKey;

pub type ExprFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
type FieldPredicate = Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync>;

fn expr_fn(f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> ExprFn {
    Arc::new(f)
}

fn predicate_fn(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> PredicateFn {
    Arc::new(f)
}

fn field_fn(f: impl Fn(Option<&Value>) -> bool + Send + Sync + 'static) -> FieldPredicate {
    Arc::new(f)
}

/// Why the compiler declined an AST.
#[derive(Debug, Clone)]
pub struct Rejected(pub String);

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

pub fn compile_expr(expr: &Expr) -> std::result::Result<ExprFn, Rejected> {
    Ok(match expr {
        Expr::Literal(v) => {
            let v = v.clone();
            expr_fn(move |_| v.clone())
        }
        Expr::FieldRef(path) => {
            let segments = split_path(path);
            expr_fn(move |doc| lookup(doc, &segments).cloned().unwrap_or(Value::Null))
        }
        Expr::Root => expr_fn(|doc| doc.clone()),
        Expr::Object(fields) => {
            let compiled = fields
                .iter()
                .map(|(name, e)| Ok((name.clone(), compile_expr(e)?)))
                .collect::<std::result::Result<Vec<_>, Rejected>>()?;
            expr_fn(move |doc| {
                let mut map = Map::new();
                for (name, f) in &compiled {
                    map.insert(name.clone(), f(doc));
                }
                Value::Object(map)
            })
        }
        Expr::Array(items) => {
            let compiled = compile_all(items)?;
            expr_fn(move |doc| Value::Array(compiled.iter().map(|f| f(doc)).collect()))
        }
        Expr::Call(Op::And, args) => {
            let compiled = compile_all(args)?;
            expr_fn(move |doc| Value::Bool(compiled.iter().all(|f| is_truthy(&f(doc)))))
        }
        Expr::Call(Op::Or, args) => {
            let compiled = compile_all(args)?;
            expr_fn(move |doc| Value::Bool(compiled.iter().any(|f| is_truthy(&f(doc)))))
        }
        Expr::Call(Op::IfNull, args) => {
            let compiled = compile_all(args)?;
            expr_fn(move |doc| {
                let Some((last, init)) = compiled.split_last() else {
                    return Value::Null;
                };
                for f in init {
                    let v = f(doc);
                    if !v.is_null() {
                        return v;
                    }
                }
                last(doc)
            })
        }
        Expr::Call(op, args) if is_comparison(*op) => compile_comparison(*op, args)?,
        Expr::Call(op, args) => {
            let op = *op;
            let compiled = compile_all(args)?;
            expr_fn(move |doc| {
                let values: Vec<Value> = compiled.iter().map(|f| f(doc)).collect();
                apply(op, &values)
            })
        }
        Expr::Cond {
            test,
            then,
            otherwise,
        } => {
            let (test, then, otherwise) =
                (compile_expr(test)?, compile_expr(then)?, compile_expr(otherwise)?);
            expr_fn(move |doc| {
                if is_truthy(&test(doc)) {
                    then(doc)
                } else {
                    otherwise(doc)
                }
            })
        }
        Expr::Switch { branches, default } => {
            let branches = branches
                .iter()
                .map(|(c, t)| Ok((compile_expr(c)?, compile_expr(t)?)))
                .collect::<std::result::Result<Vec<_>, Rejected>>()?;
            let default = default.as_deref().map(compile_expr).transpose()?;
            expr_fn(move |doc| {
                for (case, then) in &branches {
                    if is_truthy(&case(doc)) {
                        return then(doc);
                    }
                }
                default.as_ref().map_or(Value::Null, |d| d(doc))
            })
        }
        Expr::DateToString { format, date } => {
            let format = format.clone();
            let date = compile_expr(date)?;
            expr_fn(move |doc| date_to_string(&format, &date(doc)))
        }
        Expr::Invalid(reason) => return Err(Rejected(reason.clone())),
    })
}

fn compile_all(items: &[Expr]) -> std::result::Result<Vec<ExprFn>, Rejected> {
    items.iter().map(compile_expr).collect()
}

fn is_comparison(op: Op) -> bool {
    matches!(op, Op::Eq | Op::Ne | Op::Gt | Op::Gte | Op::Lt | Op::Lte | Op::Cmp)
}

/// Comparisons against a literal convert the literal once.
fn compile_comparison(op: Op, args: &[Expr]) -> std::result::Result<ExprFn, Rejected> {
    let finish = move |ord: Ordering| -> Value {
        match op {
            Op::Eq => Value::Bool(ord.is_eq()),
            Op::Ne => Value::Bool(ord.is_ne()),
            Op::Gt => Value::Bool(ord.is_gt()),
            Op::Gte => Value::Bool(ord.is_ge()),
            Op::Lt => Value::Bool(ord.is_lt()),
            Op::Lte => Value::Bool(ord.is_le()),
            _ => Value::from(ord as i64),
        }
    };
    Ok(match (&args[0], &args[1]) {
        (lhs, Expr::Literal(lit)) => {
            let lhs = compile_expr(lhs)?;
            let lit = ValueKey::from_json(lit);
            expr_fn(move |doc| finish(ValueKey::from_json(&lhs(doc)).cmp(&lit)))
        }
        (Expr::Literal(lit), rhs) => {
            let rhs = compile_expr(rhs)?;
            let lit = ValueKey::from_json(lit);
            expr_fn(move |doc| finish(lit.cmp(&ValueKey::from_json(&rhs(doc)))))
        }
        (lhs, rhs) => {
            let (lhs, rhs) = (compile_expr(lhs)?, compile_expr(rhs)?);
            expr_fn(move |doc| {
                finish(ValueKey::from_json(&lhs(doc)).cmp(&ValueKey::from_json(&rhs(doc))))
            })
        }
    })
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn compile_query(query: &Query) -> std::result::Result<PredicateFn, Rejected> {
    Ok(match query {
        Query::All => predicate_fn(|_| true),
        Query::Field { field, op } => {
            let segments = split_path(field);
            let op = compile_op(op)?;
            predicate_fn(move |doc| op(lookup(doc, &segments)))
        }
        Query::And(subs) => {
            let subs = compile_queries(subs)?;
            predicate_fn(move |doc| subs.iter().all(|f| f(doc)))
        }
        Query::Or(subs) => {
            let subs = compile_queries(subs)?;
            predicate_fn(move |doc| subs.iter().any(|f| f(doc)))
        }
        Query::Nor(subs) => {
            let subs = compile_queries(subs)?;
            predicate_fn(move |doc| !subs.iter().any(|f| f(doc)))
        }
        Query::Expr(expr) => {
            let f = compile_expr(expr)?;
            predicate_fn(move |doc| is_truthy(&f(doc)))
        }
        Query::Invalid(reason) => return Err(Rejected(reason.clone())),
    })
}

fn compile_queries(subs: &[Query]) -> std::result::Result<Vec<PredicateFn>, Rejected> {
    subs.iter().map(compile_query).collect()
}

fn compile_op(op: &QueryOp) -> std::result::Result<FieldPredicate, Rejected> {
    Ok(match op {
        QueryOp::Regex(spec) => {
            let re = spec
                .build()
                .ok_or_else(|| Rejected(format!("invalid regex: {}", spec.pattern)))?;
            field_fn(move |value| regex_matches(&re, value))
        }
        QueryOp::Not(ops) => {
            let ops = compile_ops(ops)?;
            field_fn(move |value| !ops.iter().all(|f| f(value)))
        }
        QueryOp::ElemMatchOps(ops) => {
            let ops = compile_ops(ops)?;
            field_fn(move |value| match value {
                Some(Value::Array(items)) => {
                    items.iter().any(|el| ops.iter().all(|f| f(Some(el))))
                }
                _ => false,
            })
        }
        QueryOp::ElemMatch(sub) => {
            let sub = compile_query(sub)?;
            field_fn(move |value| match value {
                Some(Value::Array(items)) => items.iter().any(|el| sub(el)),
                _ => false,
            })
        }
        QueryOp::Invalid(reason) => return Err(Rejected(reason.clone())),
        plain => {
            let plain = plain.clone();
            field_fn(move |value| plain.matches_plain(value))
        }
    })
}

fn compile_ops(ops: &[QueryOp]) -> std::result::Result<Vec<FieldPredicate>, Rejected> {
    ops.iter().map(compile_op).collect()
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Pre-split equivalent of `document::get_path`.
fn lookup<'a>(doc: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = doc;
    for part in segments {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries served by the interpreter because compilation was declined.
    pub fallbacks: u64,
    pub entries: usize,
}

/// Compiled functions keyed by the canonical JSON text of their source, so
/// identical expressions across stages and plans share one closure.
pub struct ExprCache {
    compile: bool,
    exprs: HashMap<String, ExprFn>,
    predicates: HashMap<String, PredicateFn>,
    stats: CacheStats,
}

impl ExprCache {
    pub fn new(compile: bool) -> Self {
        Self {
            compile,
            exprs: HashMap::new(),
            predicates: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn expression(&mut self, source: &Value) -> ExprFn {
        let key = source.to_string();
        if let Some(f) = self.exprs.get(&key) {
            self.stats.hits += 1;
            return f.clone();
        }
        self.stats.misses += 1;
        debug!(expr = %key, "compiling expression");
        let ast = parse_expression(source);
        let compiled = if self.compile {
            compile_expr(&ast)
        } else {
            Err(Rejected("compilation disabled".into()))
        };
        let f = compiled.unwrap_or_else(|Rejected(reason)| {
            debug!(expr = %key, %reason, "falling back to interpreter");
            self.stats.fallbacks += 1;
            let f: ExprFn = Arc::new(move |doc: &Value| ast.eval(doc));
            f
        });
        self.exprs.insert(key, f.clone());
        f
    }

    /// Compile a `$match` body. Fails only when the body is not an object.
    pub fn predicate(&mut self, source: &Value) -> Result<PredicateFn> {
        let key = source.to_string();
        if let Some(f) = self.predicates.get(&key) {
            self.stats.hits += 1;
            return Ok(f.clone());
        }
        let ast = parse_query(source)?;
        self.stats.misses += 1;
        debug!(query = %key, "compiling predicate");
        let compiled = if self.compile {
            compile_query(&ast)
        } else {
            Err(Rejected("compilation disabled".into()))
        };
        let f = compiled.unwrap_or_else(|Rejected(reason)| {
            debug!(query = %key, %reason, "falling back to interpreter");
            self.stats.fallbacks += 1;
            let f: PredicateFn = Arc::new(move |doc: &Value| ast.matches(doc));
            f
        });
        self.predicates.insert(key, f.clone());
        Ok(f)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.exprs.len() + self.predicates.len(),
            ..self.stats
        }
    }

    pub fn clear(&mut self) {
        self.exprs.clear();
        self.predicates.clear();
        self.stats = CacheStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs() -> Vec<Value> {
        vec![
            json!({}),
            json!({"a": 1, "b": 2.5, "s": "Hello", "at": "2024-02-29T12:00:00Z"}),
            json!({"a": -4, "b": 0, "s": "", "tags": ["x", "y"], "n": null}),
            json!({"a": "7", "b": [1, 2], "s": "abc", "nested": {"k": 3}}),
            json!({"a": 10, "items": [{"q": 2}, {"q": 9}], "tags": "x"}),
        ]
    }

    #[test]
    fn compiled_expressions_agree_with_interpreter() {
        let exprs = vec![
            json!("$a"),
            json!("$nested.k"),
            json!({"$add": ["$a", "$b", 1]}),
            json!({"$divide": ["$a", "$b"]}),
            json!({"$gt": ["$a", 2]}),
            json!({"$lte": [5, "$a"]}),
            json!({"$cmp": ["$a", "$b"]}),
            json!({"$cond": [{"$gte": ["$a", 0]}, "pos", "neg"]}),
            json!({"$ifNull": ["$n", "$missing", "dflt"]}),
            json!({"$and": ["$a", {"$ne": ["$s", ""]}]}),
            json!({"$or": [false, "$b"]}),
            json!({"$concat": ["$s", "-", {"$toUpper": "$s"}]}),
            json!({"$year": "$at"}),
            json!({"$dateToString": {"format": "%Y-%m-%d %L", "date": "$at"}}),
            json!({"$size": "$tags"}),
            json!({"$switch": {"branches": [{"case": {"$isArray": "$b"}, "then": "arr"}]}}),
            json!({"total": {"$multiply": ["$a", 2]}, "root": "$$ROOT"}),
            json!(["$a", {"$type": "$b"}]),
        ];
        for src in exprs {
            let ast = parse_expression(&src);
            let compiled = compile_expr(&ast).expect("compiles");
            for doc in docs() {
                assert_eq!(compiled(&doc), ast.eval(&doc), "{src} on {doc}");
            }
        }
    }

    #[test]
    fn compiled_queries_agree_with_interpreter() {
        let queries = vec![
            json!({}),
            json!({"a": 1}),
            json!({"a": {"$gte": 0, "$lt": 5}}),
            json!({"tags": "x"}),
            json!({"tags": {"$in": ["y", "z"]}}),
            json!({"s": {"$regex": "^h", "$options": "i"}}),
            json!({"a": {"$not": {"$gt": 1}}}),
            json!({"items": {"$elemMatch": {"q": {"$gt": 5}}}}),
            json!({"b": {"$elemMatch": {"$gte": 2}}}),
            json!({"$or": [{"a": {"$exists": false}}, {"b": 0}]}),
            json!({"$nor": [{"a": 1}]}),
            json!({"$expr": {"$gt": ["$a", "$b"]}}),
            json!({"n": null}),
        ];
        for src in queries {
            let ast = parse_query(&src).unwrap();
            let compiled = compile_query(&ast).expect("compiles");
            for doc in docs() {
                assert_eq!(compiled(&doc), ast.matches(&doc), "{src} on {doc}");
            }
        }
    }

    #[test]
    fn invalid_nodes_are_rejected() {
        assert!(compile_expr(&parse_expression(&json!({"$nope": 1}))).is_err());
        let q = parse_query(&json!({"s": {"$regex": "(unclosed"}})).unwrap();
        assert!(compile_query(&q).is_err());
    }

    #[test]
    fn cache_shares_identical_expressions() {
        let mut cache = ExprCache::new(true);
        let a = cache.expression(&json!({"$add": ["$x", 1]}));
        let b = cache.expression(&json!({"$add": ["$x", 1]}));
        assert!(Arc::ptr_eq(&a, &b));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn fallback_serves_interpreter_results() {
        let mut cache = ExprCache::new(true);
        let f = cache.expression(&json!({"sum": {"$add": ["$x", 1]}, "bad": {"$nope": 1}}));
        assert_eq!(f(&json!({"x": 1})), json!({"sum": 2, "bad": null}));
        assert_eq!(cache.stats().fallbacks, 1);

        let mut cache = ExprCache::new(false);
        let p = cache.predicate(&json!({"x": {"$gt": 1}})).unwrap();
        assert!(p(&json!({"x": 2})));
        assert_eq!(cache.stats().fallbacks, 1);
    }
}
