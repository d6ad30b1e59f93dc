//! Canonical JSON serialization and sha256 fingerprints.
//!
//! Canonical form: object keys sorted byte-wise, no insignificant
//! whitespace, UTF-8, and numbers rendered without exponents or a
//! trailing `.0`. The same serializer is used both to fingerprint the
//! prompt envelope and to compute the signing digest of the final
//! response, so there is exactly one place that can introduce
//! library-order or locale dependence.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Render a [`Value`] as canonical JSON bytes.
///
/// Object keys are sorted lexicographically at every level; arrays keep
/// their order (order is semantically meaningful everywhere it appears in
/// this system). Numbers are rendered through [`canonical_number`] rather
/// than `serde_json`'s default formatter so the output is stable across
/// targets.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out.into_bytes()
}

/// Serialize `value` to a [`Value`] tree and return its canonical bytes.
///
/// # Panics
/// Panics if `value` cannot be represented as JSON, which does not happen
/// for any type in this workspace (no floats-as-keys, no non-string map
/// keys, no unrepresentable values).
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    let v = serde_json::to_value(value).expect("serialization to serde_json::Value cannot fail");
    canonical_bytes(&v)
}

/// sha256 hex digest of the given bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// `sha256:`-prefixed fingerprint of the canonical bytes of `value`.
pub fn fingerprint<T: Serialize>(value: &T) -> String {
    format!("sha256:{}", sha256_hex(&to_canonical_bytes(value)))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&canonical_number(n)),
        Value::String(s) => write_json_string(s, out),
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
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Render a `serde_json::Number` deterministically: integers without an
/// exponent or trailing `.0`, no `-0`, floats with the shortest
/// round-tripping decimal representation.
fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    let f = n.as_f64().unwrap_or(0.0);
    if f == 0.0 {
        return "0".to_string();
    }
    let mut s = format!("{f}");
    if !s.contains('.') && !s.contains('e') && !s.contains('E') {
        s.push_str(".0");
    }
    s
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys_at_every_level() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
        assert_eq!(
            String::from_utf8(canonical_bytes(&a)).unwrap(),
            r#"{"a":{"c":3,"d":2},"b":1}"#
        );
    }

    #[test]
    fn preserves_array_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(String::from_utf8(canonical_bytes(&v)).unwrap(), "[3,1,2]");
    }

    #[test]
    fn integers_have_no_trailing_fraction() {
        assert_eq!(canonical_number(&serde_json::Number::from(42)), "42");
    }

    #[test]
    fn fingerprint_is_key_order_independent() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert!(fingerprint(&a).starts_with("sha256:"));
    }

    proptest::proptest! {
        #[test]
        fn canonical_bytes_are_valid_utf8_json(s in "[a-zA-Z0-9_ ]{0,64}") {
            let v = json!({"k": s});
            let bytes = canonical_bytes(&v);
            let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(reparsed, v);
        }
    }
}
