use std::cmp::Ordering;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

/// Comparable form of a document value with a total, type-aware ordering.
///
/// Dates are kept as i64 millisecond timestamps so date strings compare
/// chronologically instead of lexically. Integers and floats compare by
/// numeric value, so `42` and `42.0` are equal keys.
#[derive(Debug, Clone)]
pub enum ValueKey {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    DateTime(i64), // millis since epoch
    String(String),
    Document(Vec<(String, ValueKey)>),
    Array(Vec<ValueKey>),
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ValueKey::Null => 0u8.hash(state),
            ValueKey::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            // An integral float hashes as the integer it equals.
            ValueKey::Integer(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            ValueKey::Float(f) => {
                2u8.hash(state);
                match exact_integer(*f) {
                    Some(i) => i.hash(state),
                    None => sortable_f64(*f).hash(state),
                }
            }
            ValueKey::DateTime(ms) => {
                3u8.hash(state);
                ms.hash(state);
            }
            ValueKey::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            ValueKey::Document(fields) => {
                5u8.hash(state);
                fields.hash(state);
            }
            ValueKey::Array(items) => {
                6u8.hash(state);
                items.hash(state);
            }
        }
    }
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for ValueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use ValueKey::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Boolean(_), _) => Ordering::Less,
            (_, Boolean(_)) => Ordering::Greater,

            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => cmp_int_float(*a, *b),
            (Float(a), Integer(b)) => cmp_int_float(*b, *a).reverse(),
            (Float(a), Float(b)) => normalize_zero(*a).total_cmp(&normalize_zero(*b)),
            (Integer(_) | Float(_), _) => Ordering::Less,
            (_, Integer(_) | Float(_)) => Ordering::Greater,

            (DateTime(a), DateTime(b)) => a.cmp(b),
            (DateTime(_), _) => Ordering::Less,
            (_, DateTime(_)) => Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
            (String(_), _) => Ordering::Less,
            (_, String(_)) => Ordering::Greater,

            (Document(a), Document(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Document(_), _) => Ordering::Less,
            (_, Document(_)) => Ordering::Greater,

            (Array(a), Array(b)) => a.cmp(b),
        }
    }
}

fn normalize_zero(f: f64) -> f64 {
    if f == 0.0 { 0.0 } else { f }
}

/// 2^63, the smallest float above every i64.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// The i64 equal to `f`, if there is one.
fn exact_integer(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f)).then_some(f as i64)
}

/// Exact comparison: neither side is rounded through the other's type.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return (i as f64).total_cmp(&f);
    }
    if f >= I64_BOUND {
        return Ordering::Less;
    }
    if f < -I64_BOUND {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    i.cmp(&(whole as i64)).then_with(|| {
        if f > whole {
            Ordering::Less
        } else if f < whole {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    })
}

/// Map an f64 onto a u64 whose unsigned order matches the float order.
fn sortable_f64(f: f64) -> u64 {
    let bits = normalize_zero(f).to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

impl ValueKey {
    /// Convert a JSON value to a key. Strings that look like dates are
    /// parsed to `DateTime`.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ValueKey::Null,
            Value::Bool(b) => ValueKey::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ValueKey::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    ValueKey::Float(f)
                } else {
                    ValueKey::Null
                }
            }
            Value::String(s) => Self::parse_string(s),
            Value::Array(items) => ValueKey::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => ValueKey::Document(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn parse_string(s: &str) -> Self {
        match parse_datetime(s) {
            Some(ms) => ValueKey::DateTime(ms),
            None => ValueKey::String(s.to_string()),
        }
    }

    /// Convert back to JSON. Dates become RFC 3339 strings.
    pub fn to_json(&self) -> Value {
        match self {
            ValueKey::Null => Value::Null,
            ValueKey::Boolean(b) => Value::Bool(*b),
            ValueKey::Integer(i) => Value::Number((*i).into()),
            ValueKey::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueKey::DateTime(ms) => match DateTime::from_timestamp_millis(*ms) {
                Some(dt) => Value::String(dt.to_rfc3339()),
                None => Value::Number((*ms).into()),
            },
            ValueKey::String(s) => Value::String(s.clone()),
            ValueKey::Document(fields) => {
                let mut map = Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), v.to_json());
                }
                Value::Object(map)
            }
            ValueKey::Array(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
        }
    }

    /// Serialize into a string whose lexicographic order matches `Ord`.
    ///
    /// Used as the group-table key, so equal keys must encode identically
    /// (`1` and `1.0` both encode as the number one).
    pub fn encode(&self) -> String {
        let mut out = String::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut String) {
        match self {
            ValueKey::Null => out.push('a'),
            ValueKey::Boolean(b) => {
                out.push('b');
                out.push(if *b { '1' } else { '0' });
            }
            // Numbers encode as the nearest float, then the integer's
            // distance from it, so integers beyond 2^53 stay distinct.
            ValueKey::Integer(i) => {
                let nearest = *i as f64;
                let offset = i128::from(*i) - nearest as i128;
                encode_number(out, nearest, offset as i64);
            }
            ValueKey::Float(f) => encode_number(out, *f, 0),
            ValueKey::DateTime(ms) => {
                out.push('d');
                let _ = write!(out, "{:016x}", (*ms as u64) ^ (1 << 63));
            }
            ValueKey::String(s) => {
                out.push('e');
                push_escaped(out, s);
            }
            ValueKey::Document(fields) => {
                out.push('f');
                for (k, v) in fields {
                    out.push('\u{2}');
                    push_escaped(out, k);
                    v.encode_into(out);
                }
                out.push('\u{1}');
            }
            ValueKey::Array(items) => {
                out.push('g');
                for item in items {
                    item.encode_into(out);
                }
                out.push('\u{1}');
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ValueKey::Integer(i) => Some(*i as f64),
            ValueKey::Float(f) => Some(*f),
            _ => None,
        }
    }
}

fn encode_number(out: &mut String, nearest: f64, offset: i64) {
    out.push('c');
    let _ = write!(
        out,
        "{:016x}{:016x}",
        sortable_f64(nearest),
        (offset as u64) ^ (1 << 63)
    );
}

/// NUL-terminated string with embedded NULs escaped so prefixes sort first.
fn push_escaped(out: &mut String, s: &str) {
    for ch in s.chars() {
        if ch == '\0' {
            out.push('\0');
            out.push('\u{ff}');
        } else {
            out.push(ch);
        }
    }
    out.push('\0');
}

/// Parse the date formats documents use into epoch milliseconds.
pub fn parse_datetime(s: &str) -> Option<i64> {
    // Fast path: valid date strings start with YYYY-MM.
    let b = s.as_bytes();
    if b.len() < 10
        || !b[0].is_ascii_digit()
        || !b[1].is_ascii_digit()
        || !b[2].is_ascii_digit()
        || !b[3].is_ascii_digit()
        || b[4] != b'-'
        || !b[5].is_ascii_digit()
        || !b[6].is_ascii_digit()
    {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
    }
    None
}

/// Interpret a value as a point in time: date strings or epoch millis.
pub fn datetime_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_datetime(s).and_then(DateTime::from_timestamp_millis),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Compare two JSON values with `ValueKey` semantics.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    ValueKey::from_json(a).cmp(&ValueKey::from_json(b))
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// Name used by `$type`.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(n) if n.as_i64().is_some_and(|i| i32::try_from(i).is_ok()) => "int",
        Value::Number(_) => "long",
        Value::String(s) if parse_datetime(s).is_some() => "date",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Build a JSON number from an f64, keeping integral values as integers.
pub fn number_to_value(n: f64) -> Value {
    if let Some(i) = exact_integer(n) {
        Value::Number(i.into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
