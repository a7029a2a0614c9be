//! Filter activity checks

use serde_json::{Map, Value};

/// A filter value restricts results when it carries something to match on:
/// non-blank strings, any number, `true`, or containers holding one of those.
pub fn is_filter_value_active(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => true,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => items.iter().any(is_filter_value_active),
        Value::Object(fields) => fields.values().any(is_filter_value_active),
    }
}

pub fn has_active_filters(filters: &Map<String, Value>) -> bool {
    filters.values().any(is_filter_value_active)
}
