//! Aggregation expressions: `"$field"` references, literals, and operator
//! objects such as `{"$add": ["$a", 1]}`.
//!
//! Parsing never fails on an expression's content. Unknown operators and
//! wrong arity become [`Expr::Invalid`], which evaluates to `null`, so one bad
//! expression degrades a single field instead of aborting a pipeline.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::{Map, Value};

use crate::document::get_path;
use crate::value::{self, number_to_value, ValueKey};

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Abs,
    Ceil,
    Floor,
    Round,
    // string
    Concat,
    ToUpper,
    ToLower,
    Substr,
    StrLenCP,
    Trim,
    Split,
    // date
    Year,
    Month,
    DayOfMonth,
    Hour,
    Minute,
    Second,
    DayOfWeek,
    DayOfYear,
    // array
    ArrayElemAt,
    Slice,
    ConcatArrays,
    Size,
    In,
    IsArray,
    // comparison
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    // logical
    And,
    Or,
    Not,
    // conditional
    IfNull,
    // misc
    Type,
}

impl Op {
    pub fn from_name(name: &str) -> Option<Op> {
        Some(match name {
            "$add" => Op::Add,
            "$subtract" => Op::Subtract,
            "$multiply" => Op::Multiply,
            "$divide" => Op::Divide,
            "$mod" => Op::Mod,
            "$abs" => Op::Abs,
            "$ceil" => Op::Ceil,
            "$floor" => Op::Floor,
            "$round" => Op::Round,
            "$concat" => Op::Concat,
            "$toUpper" => Op::ToUpper,
            "$toLower" => Op::ToLower,
            "$substr" | "$substrCP" => Op::Substr,
            "$strLenCP" => Op::StrLenCP,
            "$trim" => Op::Trim,
            "$split" => Op::Split,
            "$year" => Op::Year,
            "$month" => Op::Month,
            "$dayOfMonth" => Op::DayOfMonth,
            "$hour" => Op::Hour,
            "$minute" => Op::Minute,
            "$second" => Op::Second,
            "$dayOfWeek" => Op::DayOfWeek,
            "$dayOfYear" => Op::DayOfYear,
            "$arrayElemAt" => Op::ArrayElemAt,
            "$slice" => Op::Slice,
            "$concatArrays" => Op::ConcatArrays,
            "$size" => Op::Size,
            "$in" => Op::In,
            "$isArray" => Op::IsArray,
            "$eq" => Op::Eq,
            "$ne" => Op::Ne,
            "$gt" => Op::Gt,
            "$gte" => Op::Gte,
            "$lt" => Op::Lt,
            "$lte" => Op::Lte,
            "$cmp" => Op::Cmp,
            "$and" => Op::And,
            "$or" => Op::Or,
            "$not" => Op::Not,
            "$ifNull" => Op::IfNull,
            "$type" => Op::Type,
            _ => return None,
        })
    }

    /// Accepted argument count as (min, max).
    fn arity(self) -> (usize, usize) {
        use Op::*;
        match self {
            Add | Multiply | Concat | ConcatArrays | And | Or => (0, usize::MAX),
            IfNull => (2, usize::MAX),
            Subtract | Divide | Mod | ArrayElemAt | Split | In | Eq | Ne | Gt | Gte | Lt
            | Lte | Cmp => (2, 2),
            Substr => (3, 3),
            Slice => (2, 3),
            Round | Trim => (1, 2),
            Abs | Ceil | Floor | ToUpper | ToLower | StrLenCP | Year | Month | DayOfMonth
            | Hour | Minute | Second | DayOfWeek | DayOfYear | Size | IsArray | Not | Type => {
                (1, 1)
            }
        }
    }

    /// Operators whose later arguments must not be evaluated eagerly.
    pub fn is_short_circuit(self) -> bool {
        matches!(self, Op::And | Op::Or | Op::IfNull)
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    FieldRef(String),
    /// `$$ROOT` / `$$CURRENT`
    Root,
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Call(Op, Vec<Expr>),
    Cond {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Switch {
        branches: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },
    DateToString {
        format: String,
        date: Box<Expr>,
    },
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse_expression(val: &Value) -> Expr {
    match val {
        Value::String(s) if s == "$$ROOT" || s == "$$CURRENT" => Expr::Root,
        Value::String(s) if s.starts_with("$$") => {
            Expr::Invalid(format!("unknown variable {s}"))
        }
        Value::String(s) if s.starts_with('$') && s.len() > 1 => {
            Expr::FieldRef(s[1..].to_string())
        }
        Value::Array(items) => Expr::Array(items.iter().map(parse_expression).collect()),
        Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
            let Some((key, arg)) = map.iter().next() else {
                return Expr::Literal(Value::Object(Map::new()));
            };
            parse_operator(key, arg)
        }
        Value::Object(map) => {
            if let Some(op) = map.keys().find(|k| k.starts_with('$')) {
                return Expr::Invalid(format!("operator {op} mixed with fields"));
            }
            Expr::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), parse_expression(v)))
                    .collect(),
            )
        }
        _ => Expr::Literal(val.clone()),
    }
}

fn parse_operator(name: &str, arg: &Value) -> Expr {
    match name {
        "$literal" => Expr::Literal(arg.clone()),
        "$cond" => parse_cond(arg),
        "$switch" => parse_switch(arg),
        "$dateToString" => parse_date_to_string(arg),
        "$trim" => {
            let Some(obj) = arg.as_object() else {
                return Expr::Invalid("$trim requires an object".into());
            };
            let Some(input) = obj.get("input") else {
                return Expr::Invalid("$trim requires 'input'".into());
            };
            let mut args = vec![parse_expression(input)];
            if let Some(chars) = obj.get("chars") {
                args.push(parse_expression(chars));
            }
            Expr::Call(Op::Trim, args)
        }
        _ => {
            let Some(op) = Op::from_name(name) else {
                return Expr::Invalid(format!("unknown operator {name}"));
            };
            let args = operator_args(op, arg);
            let (min, max) = op.arity();
            if args.len() < min || args.len() > max {
                return Expr::Invalid(format!(
                    "{name} takes {min}..{max} arguments, got {}",
                    args.len()
                ));
            }
            Expr::Call(op, args)
        }
    }
}

fn operator_args(op: Op, arg: &Value) -> Vec<Expr> {
    let date_part = matches!(
        op,
        Op::Year | Op::Month | Op::DayOfMonth | Op::Hour | Op::Minute | Op::Second
            | Op::DayOfWeek | Op::DayOfYear
    );
    match arg {
        // {"$year": {"date": "$created"}}
        Value::Object(obj) if date_part && obj.contains_key("date") => {
            vec![parse_expression(&obj["date"])]
        }
        Value::Array(items) => items.iter().map(parse_expression).collect(),
        other => vec![parse_expression(other)],
    }
}

fn parse_cond(arg: &Value) -> Expr {
    let parts = match arg {
        Value::Array(items) if items.len() == 3 => {
            Some((&items[0], &items[1], &items[2]))
        }
        Value::Object(obj) => match (obj.get("if"), obj.get("then"), obj.get("else")) {
            (Some(i), Some(t), Some(e)) => Some((i, t, e)),
            _ => None,
        },
        _ => None,
    };
    match parts {
        Some((test, then, otherwise)) => Expr::Cond {
            test: Box::new(parse_expression(test)),
            then: Box::new(parse_expression(then)),
            otherwise: Box::new(parse_expression(otherwise)),
        },
        None => Expr::Invalid("$cond requires if/then/else".into()),
    }
}

fn parse_switch(arg: &Value) -> Expr {
    let Some(branches) = arg.get("branches").and_then(Value::as_array) else {
        return Expr::Invalid("$switch requires 'branches' array".into());
    };
    let mut parsed = Vec::with_capacity(branches.len());
    for branch in branches {
        match (branch.get("case"), branch.get("then")) {
            (Some(case), Some(then)) => {
                parsed.push((parse_expression(case), parse_expression(then)))
            }
            _ => return Expr::Invalid("$switch branch requires case/then".into()),
        }
    }
    Expr::Switch {
        branches: parsed,
        default: arg.get("default").map(|d| Box::new(parse_expression(d))),
    }
}

fn parse_date_to_string(arg: &Value) -> Expr {
    let Some(date) = arg.get("date") else {
        return Expr::Invalid("$dateToString requires 'date'".into());
    };
    let format = arg
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or("%Y-%m-%dT%H:%M:%S.%LZ");
    Expr::DateToString {
        format: format.to_string(),
        date: Box::new(parse_expression(date)),
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

impl Expr {
    pub fn eval(&self, doc: &Value) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::FieldRef(path) => get_path(doc, path).cloned().unwrap_or(Value::Null),
            Expr::Root => doc.clone(),
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (name, expr) in fields {
                    map.insert(name.clone(), expr.eval(doc));
                }
                Value::Object(map)
            }
            Expr::Array(items) => Value::Array(items.iter().map(|e| e.eval(doc)).collect()),
            Expr::Call(Op::And, args) => Value::Bool(args.iter().all(|a| is_truthy(&a.eval(doc)))),
            Expr::Call(Op::Or, args) => Value::Bool(args.iter().any(|a| is_truthy(&a.eval(doc)))),
            Expr::Call(Op::IfNull, args) => {
                let (last, init) = match args.split_last() {
                    Some(parts) => parts,
                    None => return Value::Null,
                };
                for arg in init {
                    let v = arg.eval(doc);
                    if !v.is_null() {
                        return v;
                    }
                }
                last.eval(doc)
            }
            Expr::Call(op, args) => {
                let values: Vec<Value> = args.iter().map(|a| a.eval(doc)).collect();
                apply(*op, &values)
            }
            Expr::Cond {
                test,
                then,
                otherwise,
            } => {
                if is_truthy(&test.eval(doc)) {
                    then.eval(doc)
                } else {
                    otherwise.eval(doc)
                }
            }
            Expr::Switch { branches, default } => {
                for (case, then) in branches {
                    if is_truthy(&case.eval(doc)) {
                        return then.eval(doc);
                    }
                }
                default.as_ref().map_or(Value::Null, |d| d.eval(doc))
            }
            Expr::DateToString { format, date } => date_to_string(format, &date.eval(doc)),
            Expr::Invalid(_) => Value::Null,
        }
    }

    /// The field path when this expression is a bare `"$field"` reference.
    pub fn as_field_ref(&self) -> Option<&str> {
        match self {
            Expr::FieldRef(path) => Some(path),
            _ => None,
        }
    }
}

/// Aggregation truthiness: `false`, `null` and zero are false.
pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

/// Evaluate a non-short-circuit operator over already evaluated arguments.
/// Shared by the interpreter and the compiled closures.
pub fn apply(op: Op, args: &[Value]) -> Value {
    match op {
        Op::Add => fold_numbers(args, 0.0, |acc, n| acc + n),
        Op::Multiply => fold_numbers(args, 1.0, |acc, n| acc * n),
        Op::Subtract => binary_numbers(args, |a, b| Some(a - b)),
        Op::Divide => binary_numbers(args, |a, b| (b != 0.0).then(|| a / b)),
        Op::Mod => binary_numbers(args, |a, b| (b != 0.0).then(|| a % b)),
        Op::Abs => unary_number(args, f64::abs),
        Op::Ceil => unary_number(args, f64::ceil),
        Op::Floor => unary_number(args, f64::floor),
        Op::Round => {
            let places = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            match args.first().and_then(Value::as_f64) {
                Some(n) => {
                    let factor = 10f64.powi(places as i32);
                    number_to_value((n * factor).round() / factor)
                }
                None => Value::Null,
            }
        }
        Op::Concat => {
            let mut out = String::new();
            for arg in args {
                match arg {
                    Value::String(s) => out.push_str(s),
                    _ => return Value::Null,
                }
            }
            Value::String(out)
        }
        Op::ToUpper => Value::String(string_arg(args).to_uppercase()),
        Op::ToLower => Value::String(string_arg(args).to_lowercase()),
        Op::Substr => {
            let Some(s) = args[0].as_str() else {
                return Value::String(String::new());
            };
            let start = args[1].as_i64().unwrap_or(0).max(0) as usize;
            let len = args[2].as_i64().unwrap_or(-1);
            let chars = s.chars().skip(start);
            let out: String = if len < 0 {
                chars.collect()
            } else {
                chars.take(len as usize).collect()
            };
            Value::String(out)
        }
        Op::StrLenCP => match args[0].as_str() {
            Some(s) => Value::from(s.chars().count() as u64),
            None => Value::Null,
        },
        Op::Trim => {
            let Some(s) = args[0].as_str() else {
                return Value::Null;
            };
            let trimmed = match args.get(1).and_then(Value::as_str) {
                Some(set) => s.trim_matches(|c| set.contains(c)),
                None => s.trim(),
            };
            Value::String(trimmed.to_string())
        }
        Op::Split => match (args[0].as_str(), args[1].as_str()) {
            (Some(s), Some(sep)) if !sep.is_empty() => Value::Array(
                s.split(sep).map(|p| Value::String(p.to_string())).collect(),
            ),
            _ => Value::Null,
        },
        Op::Year => date_part(args, |d| d.year() as i64),
        Op::Month => date_part(args, |d| d.month() as i64),
        Op::DayOfMonth => date_part(args, |d| d.day() as i64),
        Op::Hour => date_part(args, |d| d.hour() as i64),
        Op::Minute => date_part(args, |d| d.minute() as i64),
        Op::Second => date_part(args, |d| d.second() as i64),
        Op::DayOfWeek => date_part(args, |d| d.weekday().number_from_sunday() as i64),
        Op::DayOfYear => date_part(args, |d| d.ordinal() as i64),
        Op::ArrayElemAt => match (&args[0], args[1].as_i64()) {
            (Value::Array(items), Some(idx)) => {
                let idx = if idx < 0 { items.len() as i64 + idx } else { idx };
                usize::try_from(idx)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .unwrap_or(Value::Null)
            }
            _ => Value::Null,
        },
        Op::Slice => slice(args),
        Op::ConcatArrays => {
            let mut out = Vec::new();
            for arg in args {
                match arg {
                    Value::Array(items) => out.extend(items.iter().cloned()),
                    _ => return Value::Null,
                }
            }
            Value::Array(out)
        }
        Op::Size => match &args[0] {
            Value::Array(items) => Value::from(items.len() as u64),
            _ => Value::Null,
        },
        Op::In => match &args[1] {
            Value::Array(items) => {
                Value::Bool(items.iter().any(|v| value::values_equal(v, &args[0])))
            }
            _ => Value::Null,
        },
        Op::IsArray => Value::Bool(args[0].is_array()),
        Op::Eq => Value::Bool(value::values_equal(&args[0], &args[1])),
        Op::Ne => Value::Bool(!value::values_equal(&args[0], &args[1])),
        Op::Gt => Value::Bool(value::compare_values(&args[0], &args[1]).is_gt()),
        Op::Gte => Value::Bool(value::compare_values(&args[0], &args[1]).is_ge()),
        Op::Lt => Value::Bool(value::compare_values(&args[0], &args[1]).is_lt()),
        Op::Lte => Value::Bool(value::compare_values(&args[0], &args[1]).is_le()),
        Op::Cmp => Value::from(value::compare_values(&args[0], &args[1]) as i64),
        Op::And => Value::Bool(args.iter().all(is_truthy)),
        Op::Or => Value::Bool(args.iter().any(is_truthy)),
        Op::Not => Value::Bool(!is_truthy(&args[0])),
        Op::IfNull => args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .or_else(|| args.last().cloned())
            .unwrap_or(Value::Null),
        Op::Type => Value::String(value::type_name(&args[0]).to_string()),
    }
}

fn fold_numbers(args: &[Value], init: f64, f: impl Fn(f64, f64) -> f64) -> Value {
    let mut acc = init;
    for arg in args {
        match arg.as_f64() {
            Some(n) => acc = f(acc, n),
            None => return Value::Null,
        }
    }
    number_to_value(acc)
}

fn binary_numbers(args: &[Value], f: impl Fn(f64, f64) -> Option<f64>) -> Value {
    match (args[0].as_f64(), args[1].as_f64()) {
        (Some(a), Some(b)) => f(a, b).map_or(Value::Null, number_to_value),
        _ => Value::Null,
    }
}

fn unary_number(args: &[Value], f: impl Fn(f64) -> f64) -> Value {
    match args[0].as_f64() {
        Some(n) => number_to_value(f(n)),
        None => Value::Null,
    }
}

fn string_arg(args: &[Value]) -> String {
    match &args[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn date_part(args: &[Value], f: impl Fn(&DateTime<Utc>) -> i64) -> Value {
    match value::datetime_of(&args[0]) {
        Some(dt) => Value::from(f(&dt)),
        None => Value::Null,
    }
}

fn slice(args: &[Value]) -> Value {
    let Value::Array(items) = &args[0] else {
        return Value::Null;
    };
    let len = items.len() as i64;
    let (start, count) = if args.len() == 2 {
        let Some(n) = args[1].as_i64() else {
            return Value::Null;
        };
        if n >= 0 {
            (0, n)
        } else {
            let Some(count) = n.checked_neg() else {
                return Value::Null;
            };
            ((len + n).max(0), count)
        }
    } else {
        let (Some(pos), Some(n)) = (args[1].as_i64(), args[2].as_i64()) else {
            return Value::Null;
        };
        if n < 0 {
            return Value::Null;
        }
        let start = if pos < 0 { (len + pos).max(0) } else { pos.min(len) };
        (start, n)
    };
    Value::Array(
        items
            .iter()
            .skip(start as usize)
            .take(count as usize)
            .cloned()
            .collect(),
    )
}

/// Format a date with the `%L` (milliseconds) specifier translated for chrono.
pub fn date_to_string(format: &str, date: &Value) -> Value {
    let Some(dt) = value::datetime_of(date) else {
        return Value::Null;
    };
    let fmt = format.replace("%L", "%3f");
    let mut out = String::new();
    use std::fmt::Write as _;
    if write!(out, "{}", dt.format(&fmt)).is_err() {
        return Value::Null;
    }
    Value::String(out)
}

/// Comparable key of an evaluated expression.
pub fn key_of(v: &Value) -> ValueKey {
    ValueKey::from_json(v)
}
