//! # Property Values
//!
//! Property values cross three domains: the device reports them over the
//! wire, the accessory host displays them, and the history log stores them.
//! Everything is carried as [`serde_json::Value`] so that transforms can be
//! written against one representation, with the coercion rules used by the
//! history recorder collected here.

use std::collections::HashMap;

use serde_json::Value;

/// A snapshot of device properties, keyed by property name.
pub type PropertyMap = HashMap<String, Value>;

/// Returns `true` for values the history recorder treats as "no reading".
///
/// Null, `false`, numeric zero, and the empty string all mean the device had
/// nothing to report for this cycle. Arrays and objects are never falsy.
#[must_use]
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// Coerces a reading into the integer form stored in history entries.
///
/// Numbers are rounded to the nearest integer, numeric strings are parsed
/// and then rounded, and booleans map to `1`/`0`. Anything else has no
/// integer form and yields `None`.
#[must_use]
pub fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(round_to_i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(round_to_i64))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn round_to_i64(v: f64) -> i64 {
    v.round() as i64
}
