//! Canonical JSON encoding.
//!
//! Identical logical payloads must hash identically across runs, platforms,
//! and language bindings, so the bytes fed to SHA-256 are produced by a
//! fixed encoding rather than whatever a serializer happens to emit:
//!
//! - UTF-8, no insignificant whitespace;
//! - object keys sorted lexicographically by Unicode code point;
//! - arrays preserve order;
//! - strings escape only `"`, `\`, and control characters (short escapes
//!   for `\b \f \n \r \t`, `\u00XX` otherwise);
//! - integers in plain decimal; floats in shortest round-trip form with
//!   no `+` on exponents; negative zero normalized to `0`.
//!
//! This is the wire format of every object, and therefore the only
//! bit-exact compatibility surface between implementations.

use serde_json::Value;

use crate::hash::ObjectHash;

/// Encode a JSON value into its canonical byte form.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(&mut out, value);
    out
}

/// Canonical encoding as a `String` (the encoding is valid UTF-8 by
/// construction).
pub fn canonical_string(value: &Value) -> String {
    String::from_utf8(canonical_bytes(value)).unwrap_or_default()
}

/// SHA-256 over the canonical byte encoding.
pub fn canonical_hash(value: &Value) -> ObjectHash {
    ObjectHash::compute(&canonical_bytes(value))
}

/// Structural equality under canonical encoding. Two values are equal when
/// their canonical bytes are equal, which also normalizes key order and
/// number forms.
pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    canonical_bytes(a) == canonical_bytes(b)
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key);
                out.push(b':');
                write_value(out, &map[key]);
            }
            out.push(b'}');
        }
    }
}

fn write_number(out: &mut Vec<u8>, n: &serde_json::Number) {
    if let Some(f) = n.as_f64() {
        // Covers both 0.0 and -0.0; integers take the as_i64/as_u64 path
        // inside Number's Display and are unaffected.
        if n.as_i64().is_none() && n.as_u64().is_none() && f == 0.0 {
            out.push(b'0');
            return;
        }
    }
    out.extend_from_slice(n.to_string().as_bytes());
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\u{08}' => out.extend_from_slice(b"\\b"),
            '\u{0c}' => out.extend_from_slice(b"\\f"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}
