use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotLimits {
    pub max_bytes: usize,
    pub repr_chars: usize,
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self {
            max_bytes: 50_000,
            repr_chars: 2_000,
        }
    }
}

/// Capture `value` for span storage. Oversized or unserializable values are
/// replaced by a truncated `Debug` rendering.
pub fn capture<T>(value: &T, limits: SnapshotLimits) -> Value
where
    T: Serialize + Debug + ?Sized,
{
    match serde_json::to_value(value) {
        Ok(captured) => {
            let size = serde_json::to_string(&captured)
                .map(|raw| raw.len())
                .unwrap_or(usize::MAX);
            if size <= limits.max_bytes {
                captured
            } else {
                repr(value, limits, true)
            }
        }
        Err(_) => repr(value, limits, false),
    }
}

fn repr<T: Debug + ?Sized>(value: &T, limits: SnapshotLimits, truncated: bool) -> Value {
    let rendered: String = format!("{value:?}").chars().take(limits.repr_chars).collect();
    if truncated {
        json!({ "repr": rendered, "_truncated": true })
    } else {
        json!({ "repr": rendered })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn small_values_are_kept_verbatim() {
        let captured = capture(&json!({"reply": "hi"}), SnapshotLimits::default());
        assert_eq!(captured, json!({"reply": "hi"}));
    }

    #[test]
    fn oversized_values_fall_back_to_truncated_repr() {
        let limits = SnapshotLimits {
            max_bytes: 32,
            repr_chars: 10,
        };
        let captured = capture(&"x".repeat(100), limits);
        assert_eq!(captured["_truncated"], json!(true));
        assert_eq!(captured["repr"].as_str().map(str::len), Some(10));
    }

    #[test]
    fn unserializable_values_use_repr_without_truncation_flag() {
        let mut map = HashMap::new();
        map.insert((1, 2), "tuple keys are not json");
        let captured = capture(&map, SnapshotLimits::default());
        assert!(captured.get("repr").is_some());
        assert!(captured.get("_truncated").is_none());
    }
}
