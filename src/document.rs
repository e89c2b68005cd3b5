use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Stable handle to a row slot. Never reused while the store lives.
pub type RowId = u64;

/// First identifier handed out for synthesized (`$unwind`) rows. Base rows
/// are numbered from zero and never reach this range.
pub const VIRTUAL_ID_BASE: RowId = 1 << 48;

pub fn is_virtual(id: RowId) -> bool {
    id >= VIRTUAL_ID_BASE
}

/// Reject anything that is not a JSON object.
pub fn validate(data: Value) -> Result<Value> {
    if !data.is_object() {
        return Err(Error::NotAnObject);
    }
    Ok(data)
}

/// Access a nested field using dot notation: "user.address.city".
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Like `get_path` but missing fields resolve to `null`.
pub fn resolve_field(doc: &Value, path: &str) -> Value {
    get_path(doc, path).cloned().unwrap_or(Value::Null)
}

/// Set a nested field, creating intermediate objects as needed.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        let child = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        current = child;
    }
}

/// Remove a nested field. Missing intermediate objects are ignored.
pub fn remove_path(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.as_object_mut()?.shift_remove(path),
        Some((parent, leaf)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = current.as_object_mut()?.get_mut(part)?;
            }
            current.as_object_mut()?.shift_remove(leaf)
        }
    }
}
