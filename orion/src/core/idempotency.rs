//! Idempotency key derivation and debounce signatures for commands.
//!
//! Keys are derived from `(target, action name, normalized args)` so that the
//! same logical request collapses regardless of key order, surrounding
//! whitespace, or explicit `null` fields in its arguments.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::types::Action;

/// Prefix marking keys the queue derived itself (as opposed to caller-supplied).
pub const DERIVED_KEY_PREFIX: &str = "auto:";

/// Normalize command arguments: trim strings and drop `null` object fields.
pub fn normalize_args(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Array(items) => Value::Array(items.iter().map(normalize_args).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), normalize_args(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Serialize with object keys sorted, independent of serde_json's map feature flags.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Derive the idempotency key for a command lacking an explicit one.
pub fn derive_key(target: &str, action: &Action) -> String {
    let normalized = normalize_args(&action.args());
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    hasher.update(b"\n");
    hasher.update(action.name().as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(&normalized).as_bytes());
    format!("{DERIVED_KEY_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Debounce signature: target plus action name, arguments excluded.
pub fn action_signature(target: &str, action: &Action) -> String {
    format!("{target}:{}", action.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn screen(args: Value) -> Action {
        Action::Screen {
            name: "open_url".to_string(),
            args,
        }
    }

    #[test]
    fn key_ignores_key_order_whitespace_and_nulls() {
        let a = screen(json!({"url": "https://x.dev", "tab": 1, "extra": null}));
        let b = screen(json!({"tab": 1, "url": "  https://x.dev "}));
        assert_eq!(derive_key("orion", &a), derive_key("orion", &b));
    }

    #[test]
    fn key_changes_with_target_and_args() {
        let a = screen(json!({"url": "https://x.dev"}));
        let b = screen(json!({"url": "https://y.dev"}));
        assert_ne!(derive_key("orion", &a), derive_key("orion", &b));
        assert_ne!(derive_key("orion", &a), derive_key("other", &a));
        assert!(derive_key("orion", &a).starts_with(DERIVED_KEY_PREFIX));
    }

    #[test]
    fn signature_excludes_args() {
        let a = screen(json!({"url": "https://x.dev"}));
        let b = screen(json!({"url": "https://y.dev"}));
        assert_eq!(action_signature("orion", &a), action_signature("orion", &b));
        assert_eq!(action_signature("orion", &a), "orion:screen.open_url");
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"d": 1, "c": [true, null]}, "a": "x"});
        assert_eq!(canonical_json(&value), r#"{"a":"x","b":{"c":[true,null],"d":1}}"#);
    }
}
