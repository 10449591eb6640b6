//! Canonical JSON serialization and SHA-256 stable content identifiers.
//!
//! Identity is tied to declared intent, never to produced bytes: two
//! manifests that describe the same stage the same way hash identically
//! even if written with different key orders.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render `value` as canonical JSON: sorted object keys, no insignificant
/// whitespace, UTF-8. `serde_json::Value::Object` is backed by a `BTreeMap`
/// under the `preserve_order` feature being *off*, so normal `to_string`
/// already sorts keys; we still walk explicitly so behavior does not depend
/// on that feature flag ever being turned on elsewhere in the dependency tree.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&serde_json::to_string(s).expect("string encodes")),
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key.as_str()).expect("string encodes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 over the canonical JSON form of `value`, as a 64-hex-char lowercase string.
pub fn id(value: &Value) -> String {
    let canon = canonicalize(value);
    let mut hasher = Sha256::new();
    hasher.update(canon.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash a sequence of `(field, value)` pairs as a JSON object, for composite
/// IDs (stage id = hash of info_name/build_id/base_id/options/inputs/mounts).
pub fn composite_id(fields: &[(&str, Value)]) -> String {
    let mut map = serde_json::Map::new();
    for (k, v) in fields {
        map.insert((*k).to_string(), v.clone());
    }
    id(&Value::Object(map))
}

/// Minimal local hex encoder so we don't pull in the `hex` crate just for this.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut s = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_form_ignores_key_order() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(id(&a), id(&b));
    }

    #[test]
    fn id_is_stable_and_deterministic() {
        let v = json!({"info_name": "org.osbuild.testing.noop", "options": {"one": 1}});
        assert_eq!(id(&v), id(&v));
        assert_eq!(id(&v).len(), 64);
        assert!(id(&v).chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn id_changes_when_value_changes() {
        let a = json!({"options": {"one": 1}});
        let b = json!({"options": {"one": 2}});
        assert_ne!(id(&a), id(&b));
    }

    #[test]
    fn composite_id_matches_manual_object() {
        let manual = json!({"info_name": "x", "build_id": "y"});
        let composite = composite_id(&[("info_name", json!("x")), ("build_id", json!("y"))]);
        assert_eq!(composite, id(&manual));
    }
}
