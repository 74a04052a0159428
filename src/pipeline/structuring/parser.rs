use serde_json::{Map, Value};

use crate::pipeline::cache::FieldMap;

/// Tokens the model uses to say "not present".
const NULL_TOKENS: &[&str] = &["N/A", "NA", "-", "NULL"];

/// Parse a model response into a JSON object, best effort.
///
/// Tries the whole response first, then the span from the first `{` to the
/// last `}`. Anything else yields an empty object.
pub fn try_parse_json(raw: &str) -> Map<String, Value> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw.trim()) {
        return map;
    }

    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return Map::new();
    };
    if end <= start {
        return Map::new();
    }

    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Normalize one extracted value to a trimmed string or `None`.
pub fn normalize_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let cleaned = collapse_whitespace(s);
            if cleaned.is_empty() || NULL_TOKENS.iter().any(|t| cleaned.eq_ignore_ascii_case(t)) {
                None
            } else {
                Some(cleaned)
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        // Nested structures are kept as compact JSON text
        other => Some(other.to_string()),
    }
}

/// Keep exactly `keys`, normalizing values; absent keys become `None`.
pub fn project_fields(parsed: &Map<String, Value>, keys: &[String]) -> FieldMap {
    keys.iter()
        .map(|k| (k.clone(), parsed.get(k).and_then(normalize_value)))
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
