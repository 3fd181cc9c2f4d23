//! Field lookup by dotted path over manifest JSON.
//!
//! A field that is missing, `null`, empty or of an unusable type reads as
//! `None`. Callers apply documented defaults; a bad field is never fatal.

use serde_json::Value;

/// Resolve `a.b.c` against a JSON value
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// String field. Numbers and booleans are rendered as text.
pub fn string(value: &Value, path: &str) -> Option<String> {
    let text = match lookup(value, path)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Non-negative integer field. Numeric strings are accepted.
pub fn integer(value: &Value, path: &str) -> Option<u64> {
    match lookup(value, path)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Boolean-as-integer flag: accepts `0`/`1`, `true`/`false` and their string forms.
pub fn flag(value: &Value, path: &str) -> Option<bool> {
    match lookup(value, path)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_u64()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
