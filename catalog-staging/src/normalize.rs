//! Value normalization shared by both sides of a diff
//!
//! Rules, applied identically to the canonical and the incoming value:
//! strings are trimmed; `null` and the empty string are both "empty";
//! a number and a numeric string compare as numbers; object keys holding
//! an empty value are ignored.

use serde_json::Value;

const NUMBER_EPSILON: f64 = 1e-9;

/// Whether two values are equal after normalization.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (a, b) if is_empty(a) || is_empty(b) => is_empty(a) && is_empty(b),
        (Value::Number(x), Value::Number(y)) => numbers_equal(x.as_f64(), y.as_f64()),
        (Value::Number(x), Value::String(s)) | (Value::String(s), Value::Number(x)) => {
            numbers_equal(x.as_f64(), s.trim().parse::<f64>().ok())
        }
        (Value::String(x), Value::String(y)) => x.trim() == y.trim(),
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            let live = |m: &serde_json::Map<String, Value>| {
                m.iter().filter(|(_, v)| !is_empty(v)).count()
            };
            live(xs) == live(ys)
                && xs
                    .iter()
                    .filter(|(_, v)| !is_empty(v))
                    .all(|(k, v)| ys.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => false,
    }
}

/// `null` or a blank string.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn numbers_equal(x: Option<f64>, y: Option<f64>) -> bool {
    match (x, y) {
        (Some(x), Some(y)) => (x - y).abs() <= NUMBER_EPSILON * x.abs().max(y.abs()).max(1.0),
        _ => false,
    }
}

/// The form in which an incoming value is stored: strings trimmed, blank
/// strings as `null`, containers normalized recursively.
pub fn canonical_value(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Value::Null
            } else {
                Value::String(trimmed.to_string())
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonical_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
