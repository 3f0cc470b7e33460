use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").expect("hardcoded regex")
});
static BRACE_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("hardcoded regex"));

fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Pull a JSON object out of free-form model text.
///
/// Tries the whole text, then the first fenced code block, then the widest
/// `{...}` span. Text with no usable object comes back as `{"raw_response": text}`.
pub fn extract_json(text: &str) -> Map<String, Value> {
    let text = text.trim();
    if let Some(map) = parse_object(text) {
        return map;
    }

    if let Some(block) = FENCED_BLOCK.captures(text).and_then(|caps| caps.get(1)) {
        if let Some(map) = parse_object(block.as_str().trim()) {
            return map;
        }
    }

    if let Some(span) = BRACE_SPAN.find(text) {
        if let Some(map) = parse_object(span.as_str()) {
            return map;
        }
    }

    let mut raw = Map::new();
    raw.insert("raw_response".to_string(), Value::String(text.to_string()));
    raw
}

/// Keys a capability may use to hand back unparsed model text.
const RAW_TEXT_KEYS: [&str; 3] = ["raw_response", "content", "text"];

/// Replace a completion that only carries raw model text with the JSON
/// object found in that text. Structured completions pass through unchanged.
pub fn normalize_completion(completion: Map<String, Value>) -> Map<String, Value> {
    if completion.len() != 1 {
        return completion;
    }
    let raw = RAW_TEXT_KEYS
        .iter()
        .find_map(|key| completion.get(*key).and_then(Value::as_str));
    match raw {
        Some(text) => {
            let parsed = extract_json(text);
            if parsed.contains_key("raw_response") {
                completion
            } else {
                parsed
            }
        }
        None => completion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_json_reads_plain_fenced_and_embedded_objects() {
        assert_eq!(
            Value::Object(extract_json(r#" {"reply": "ok"} "#)),
            json!({"reply": "ok"})
        );
        assert_eq!(
            Value::Object(extract_json("Here you go:\n```json\n{\"score\": 4}\n```\nthanks")),
            json!({"score": 4})
        );
        assert_eq!(
            Value::Object(extract_json("prefix {\"plan\": []} suffix")),
            json!({"plan": []})
        );
    }

    #[test]
    fn extract_json_wraps_unparseable_text() {
        let parsed = extract_json("  just words  ");
        assert_eq!(Value::Object(parsed), json!({"raw_response": "just words"}));
    }

    #[test]
    fn extract_json_does_not_accept_top_level_arrays() {
        let parsed = extract_json("[1, 2]");
        assert!(parsed.contains_key("raw_response"));
    }

    #[test]
    fn normalize_completion_unwraps_text_only_output() {
        let mut raw = Map::new();
        raw.insert(
            "content".to_string(),
            json!("Sure!\n```json\n{\"options\": [\"Hi\"]}\n```"),
        );
        assert_eq!(
            Value::Object(normalize_completion(raw)),
            json!({"options": ["Hi"]})
        );

        let mut structured = Map::new();
        structured.insert("options".to_string(), json!(["Hi"]));
        structured.insert("text".to_string(), json!("{\"ignored\": true}"));
        assert_eq!(normalize_completion(structured.clone()), structured);

        let mut prose = Map::new();
        prose.insert("text".to_string(), json!("no json here"));
        assert_eq!(normalize_completion(prose.clone()), prose);
    }
}
