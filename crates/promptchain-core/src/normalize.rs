//! JSON output normalization.
//!
//! Stages declared `output: json` must produce a list. This module turns the
//! raw response text into the canonical envelope
//! `{items: [{id, _selected, value, …}]}`:
//!
//! - a JSON array root becomes the item list directly;
//! - an object root with an `items` array uses that array, preserving any
//!   other top-level keys on the envelope;
//! - anything else is an [`NormalizeError::InvalidJsonShape`].
//!
//! Item ids are a pure function of the normalized item value:
//! `"item_" + hex(first 8 bytes of SHA-256 of canonical JSON of value)`,
//! where canonical JSON sorts object keys recursively and contains no
//! insignificant whitespace. Reordering a list therefore never changes ids,
//! and duplicate values hash identically (later duplicates are dropped and
//! counted).

use std::collections::BTreeSet;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

/// Errors from parsing or normalizing a JSON stage output.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NormalizeError {
    /// The response contained no parseable JSON value.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The parsed root was neither a list nor an object with an `items`
    /// list.
    #[error("invalid JSON shape: {0}")]
    InvalidJsonShape(String),
}

impl NormalizeError {
    /// Stable lowercase token recorded in stage metadata and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizeError::InvalidJson(_) => "invalid_json",
            NormalizeError::InvalidJsonShape(_) => "invalid_json_shape",
        }
    }
}

/// One normalized item.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Deterministic id derived from the canonical value.
    pub id: String,
    /// Unselected items are skipped by downstream map stages.
    pub selected: bool,
    /// The item value (arbitrary JSON).
    pub value: Value,
    /// Additional attributes carried alongside `value` (object items spread
    /// their keys here).
    pub extra: Map<String, Value>,
}

impl Item {
    /// The item as it appears inside the envelope's `items` array.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::String(self.id.clone()));
        obj.insert("_selected".to_string(), Value::Bool(self.selected));
        obj.insert("value".to_string(), self.value.clone());
        for (key, val) in &self.extra {
            obj.insert(key.clone(), val.clone());
        }
        Value::Object(obj)
    }
}

/// The canonical normalized envelope.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub items: Vec<Item>,
    /// Top-level keys preserved from an object root (everything except
    /// `items`).
    pub extra: Map<String, Value>,
    /// Count of later duplicates dropped because their canonical value hash
    /// collided with an earlier item.
    pub dropped_duplicates: usize,
}

impl Normalized {
    /// Serialize the envelope to the on-disk `output.json` shape.
    pub fn to_value(&self) -> Value {
        let items: Vec<Value> = self.items.iter().map(Item::to_value).collect();
        let mut obj = Map::new();
        obj.insert("items".to_string(), Value::Array(items));
        for (key, val) in &self.extra {
            obj.insert(key.clone(), val.clone());
        }
        if self.dropped_duplicates > 0 {
            obj.insert(
                "dropped_duplicates".to_string(),
                json!(self.dropped_duplicates),
            );
        }
        Value::Object(obj)
    }

    /// Items that are selected for execution.
    pub fn selected(&self) -> impl Iterator<Item = &Item> {
        self.items.iter().filter(|item| item.selected)
    }
}

/// Compute the deterministic id for an item value.
pub fn item_id(value: &Value) -> String {
    let canonical = canonical_json(value);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("item_{hex}")
}

/// Canonical JSON: object keys sorted recursively, compact separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let keys: BTreeSet<&String> = map.keys().collect();
            let mut first = true;
            for key in keys {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            let mut first = true;
            for item in items {
                if !first {
                    out.push(',');
                }
                first = false;
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
        }
    }
}

/// Parse the raw text of a JSON stage response.
///
/// Model responses frequently wrap JSON in markdown code fences or prose.
/// Candidates, in order: the fenced block content, the trimmed response,
/// then the first `{`/`[`-rooted value found by scanning.
pub fn parse_json_response(text: &str) -> Result<Value, NormalizeError> {
    let stripped = text.trim();

    if let Some(fenced) = extract_fenced_block(text) {
        if let Ok(value) = serde_json::from_str(fenced) {
            return Ok(value);
        }
    }

    if !stripped.is_empty() {
        if let Ok(value) = serde_json::from_str(stripped) {
            return Ok(value);
        }
    }

    if let Some(value) = scan_embedded_json(stripped) {
        return Ok(value);
    }

    Err(NormalizeError::InvalidJson(
        "no valid JSON found in response".to_string(),
    ))
}

/// Content of the first ``` or ```json fence, if any.
fn extract_fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an optional language tag up to the first newline.
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    let content = body[..end].trim();
    (!content.is_empty()).then_some(content)
}

/// First parseable JSON value rooted at a `{` or `[` in the text.
fn scan_embedded_json(text: &str) -> Option<Value> {
    let start = text
        .char_indices()
        .find(|(_, c)| *c == '{' || *c == '[')
        .map(|(i, _)| i)?;
    let candidate = &text[start..];
    let mut stream = serde_json::Deserializer::from_str(candidate).into_iter::<Value>();
    stream.next()?.ok()
}

/// Normalize a parsed JSON value into the canonical envelope.
pub fn normalize(root: Value) -> Result<Normalized, NormalizeError> {
    let (raw_items, extra) = match root {
        Value::Array(items) => (items, Map::new()),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => (items, map),
            Some(other) => {
                return Err(NormalizeError::InvalidJsonShape(format!(
                    "'items' must be an array, got {}",
                    type_name(&other)
                )));
            }
            None => {
                return Err(NormalizeError::InvalidJsonShape(
                    "object root must contain an 'items' array".to_string(),
                ));
            }
        },
        other => {
            return Err(NormalizeError::InvalidJsonShape(format!(
                "output must be a list or an object with an 'items' list, got {}",
                type_name(&other)
            )));
        }
    };

    let mut items = Vec::with_capacity(raw_items.len());
    let mut seen = BTreeSet::new();
    let mut dropped = 0usize;

    for raw in raw_items {
        let item = normalize_item(raw);
        if !seen.insert(item.id.clone()) {
            dropped += 1;
            continue;
        }
        items.push(item);
    }

    Ok(Normalized {
        items,
        extra,
        dropped_duplicates: dropped,
    })
}

/// Parse and normalize in one step.
pub fn normalize_response(text: &str) -> Result<Normalized, NormalizeError> {
    normalize(parse_json_response(text)?)
}

/// Rehydrate items from a persisted envelope (an upstream stage's
/// `output.json`). Ids are recomputed -- they are a pure function of the
/// value, so this always reproduces what the producer wrote.
pub fn items_from_envelope(envelope: &Value) -> Result<Vec<Item>, NormalizeError> {
    let items = envelope
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            NormalizeError::InvalidJsonShape(
                "envelope must contain an 'items' array".to_string(),
            )
        })?;
    Ok(items.iter().cloned().map(normalize_item).collect())
}

fn normalize_item(raw: Value) -> Item {
    let (value, selected, extra) = match raw {
        Value::Object(mut map) => {
            let selected = match map.remove("_selected") {
                Some(Value::Bool(b)) => b,
                _ => true,
            };
            // A prior `id` is recomputed, not trusted.
            map.remove("id");
            let value = match map.remove("value") {
                Some(value) => value,
                // An object without `value` keeps its whole body as the
                // value so that ids stay a pure function of content.
                None => Value::Object(map.clone()),
            };
            (value, selected, map)
        }
        other => (other, true, Map::new()),
    };

    Item {
        id: item_id(&value),
        selected,
        value,
        extra,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_id_is_deterministic_and_order_independent() {
        let a = json!({"name": "alpha", "rank": 1});
        let b = json!({"rank": 1, "name": "alpha"});
        assert_eq!(item_id(&a), item_id(&b));
        assert!(item_id(&a).starts_with("item_"));
        assert_eq!(item_id(&a).len(), "item_".len() + 16);
    }

    #[test]
    fn item_id_matches_sha256_prefix() {
        let value = json!("alpha");
        let digest = Sha256::digest(canonical_json(&value).as_bytes());
        let expected: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(item_id(&value), format!("item_{expected}"));
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [3, {"y": 4, "x": 5}]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[3,{"x":5,"y":4}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn array_root_normalizes_each_element() {
        let normalized = normalize(json!(["one", "two"])).unwrap();
        assert_eq!(normalized.items.len(), 2);
        assert_eq!(normalized.items[0].value, json!("one"));
        assert!(normalized.items[0].selected);
        assert!(normalized.extra.is_empty());
    }

    #[test]
    fn object_items_are_spread_alongside_value() {
        let normalized =
            normalize(json!([{"value": "v", "note": "n", "_selected": false}])).unwrap();
        let item = &normalized.items[0];
        assert_eq!(item.value, json!("v"));
        assert!(!item.selected);
        assert_eq!(item.extra["note"], json!("n"));
        let rendered = item.to_value();
        assert_eq!(rendered["note"], json!("n"));
        assert_eq!(rendered["_selected"], json!(false));
    }

    #[test]
    fn object_without_value_uses_whole_body() {
        let normalized = normalize(json!([{"name": "alpha", "rank": 1}])).unwrap();
        let item = &normalized.items[0];
        assert_eq!(item.value, json!({"name": "alpha", "rank": 1}));
        assert_eq!(item.id, item_id(&json!({"name": "alpha", "rank": 1})));
    }

    #[test]
    fn envelope_root_preserves_extra_keys() {
        let normalized =
            normalize(json!({"items": ["a"], "topic": "chess", "count": 1})).unwrap();
        assert_eq!(normalized.items.len(), 1);
        assert_eq!(normalized.extra["topic"], json!("chess"));
        let value = normalized.to_value();
        assert_eq!(value["topic"], json!("chess"));
        assert_eq!(value["count"], json!(1));
    }

    #[test]
    fn duplicates_keep_first_and_are_counted() {
        let normalized = normalize(json!(["a", "b", "a", "a"])).unwrap();
        assert_eq!(normalized.items.len(), 2);
        assert_eq!(normalized.dropped_duplicates, 2);
        assert_eq!(normalized.to_value()["dropped_duplicates"], json!(2));
    }

    #[test]
    fn empty_list_is_valid() {
        let normalized = normalize(json!([])).unwrap();
        assert!(normalized.items.is_empty());
        assert_eq!(normalized.dropped_duplicates, 0);
        assert!(normalized.to_value().get("dropped_duplicates").is_none());
    }

    #[test]
    fn non_list_shapes_are_rejected() {
        let err = normalize(json!("just text")).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidJsonShape(_)));
        assert_eq!(err.kind(), "invalid_json_shape");

        let err = normalize(json!({"results": []})).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidJsonShape(_)));

        let err = normalize(json!({"items": "nope"})).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidJsonShape(_)));
    }

    #[test]
    fn parse_accepts_fenced_json() {
        let text = "Here you go:\n```json\n[\"a\", \"b\"]\n```\nDone.";
        let value = parse_json_response(text).unwrap();
        assert_eq!(value, json!(["a", "b"]));
    }

    #[test]
    fn parse_accepts_bare_json() {
        let value = parse_json_response("  {\"items\": []} ").unwrap();
        assert_eq!(value, json!({"items": []}));
    }

    #[test]
    fn parse_scans_for_embedded_json() {
        let text = "Sure! The list is [1, 2, 3] as requested.";
        let value = parse_json_response(text).unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn parse_rejects_prose() {
        let err = parse_json_response("I could not produce a list.").unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidJson(_)));
        assert_eq!(err.kind(), "invalid_json");
    }

    #[test]
    fn envelope_rehydration_reproduces_ids() {
        let normalized = normalize(json!([{"name": "alpha"}, "beta"])).unwrap();
        let envelope = normalized.to_value();
        let rehydrated = items_from_envelope(&envelope).unwrap();
        assert_eq!(rehydrated.len(), 2);
        assert_eq!(rehydrated[0].id, normalized.items[0].id);
        assert_eq!(rehydrated[1].id, normalized.items[1].id);
        assert_eq!(rehydrated[0].value, normalized.items[0].value);
    }

    #[test]
    fn selected_iterator_filters() {
        let normalized = normalize(json!([
            {"value": "keep"},
            {"value": "drop", "_selected": false}
        ]))
        .unwrap();
        let kept: Vec<_> = normalized.selected().collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].value, json!("keep"));
    }
}
