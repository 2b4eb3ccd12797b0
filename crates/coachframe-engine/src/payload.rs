//! Pulling structured payloads out of free-text model replies.

use serde_json::{Map, Value};

/// Returns the body of the first fenced block, or the trimmed text when there is
/// no complete fence. A leading `json` language tag is dropped.
pub fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    let Some(open) = raw.find("```") else {
        return raw.to_string();
    };
    let after_open = &raw[open + 3..];
    let Some(close) = after_open.find("```") else {
        return raw.to_string();
    };
    let mut body = after_open[..close].trim();
    if body
        .get(..4)
        .is_some_and(|tag| tag.eq_ignore_ascii_case("json"))
    {
        body = body[4..].trim_start();
    }
    body.trim().to_string()
}

/// First JSON object found in `text`: the fence body as-is, then its outermost
/// `{...}` span.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let body = strip_code_fence(text);
    let braced = match (body.find('{'), body.rfind('}')) {
        (Some(open), Some(close)) if close > open => Some(&body[open..=close]),
        _ => None,
    };
    std::iter::once(body.as_str())
        .chain(braced)
        .filter(|candidate| !candidate.trim().is_empty())
        .find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(object)) => Some(object),
            _ => None,
        })
}

/// Normalises a list-ish value into trimmed, whitespace-collapsed, de-duplicated
/// strings. Accepts an array of strings or `{text|issue}` objects, or a
/// comma-separated string. Duplicates compare case-insensitively.
pub fn coerce_text_list(value: Option<&Value>, max_items: usize, max_chars: usize) -> Vec<String> {
    let entries: Vec<&str> = match value {
        Some(Value::Array(rows)) => rows.iter().filter_map(list_entry).collect(),
        Some(Value::String(joined)) => joined.split(',').collect(),
        _ => Vec::new(),
    };

    let mut kept: Vec<String> = Vec::new();
    for entry in entries {
        if kept.len() >= max_items {
            break;
        }
        let collapsed = entry.split_whitespace().collect::<Vec<_>>().join(" ");
        let clipped: String = collapsed.chars().take(max_chars).collect();
        let clipped = clipped.trim_end();
        if clipped.is_empty() || kept.iter().any(|prior| prior.eq_ignore_ascii_case(clipped)) {
            continue;
        }
        kept.push(clipped.to_string());
    }
    kept
}

fn list_entry(row: &Value) -> Option<&str> {
    match row {
        Value::String(text) => Some(text.as_str()),
        Value::Object(fields) => ["text", "issue"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str)),
        _ => None,
    }
}

/// Unwraps a `json!({...})` literal into its map; anything else becomes empty.
pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &value[..cut]),
        None => value.to_string(),
    }
}
