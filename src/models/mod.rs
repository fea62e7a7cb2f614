//! Shared domain types and lenient numeric parsing.
//!
//! Upstream payloads carry numbers as strings (or occasionally as JSON
//! numbers); raw values stay untouched until a stage boundary applies a
//! typed parser.

pub mod depth;
pub mod spread;
pub mod universe;

use serde_json::Value;

/// Parse a loosely-typed JSON value as a finite float.
///
/// Accepts JSON numbers and numeric strings; anything else is `None`.
pub fn parse_float(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Parse a loosely-typed JSON value as an integer (float-tolerant, like
/// upstream trade counts that arrive as `"12345"` or `12345.0`).
pub fn parse_int(value: &Value) -> Option<i64> {
    parse_float(value).map(|v| v as i64)
}

/// Render a raw payload value the way it arrived on the wire.
///
/// String values are kept verbatim; numbers fall back to their JSON text.
pub fn raw_value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
