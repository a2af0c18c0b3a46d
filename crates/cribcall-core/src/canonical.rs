//! Deterministic JSON canonicalisation (RFC 8785 profile) + HMAC tags.
//!
//! Every signed or hashed payload in the protocol — pairing transcripts,
//! comparison codes, the QR payload — goes through [`canonical_json`] so both
//! sides hash identical bytes: object keys sorted by UTF-16 code units, no
//! whitespace, minimal integer decimals. Floats are rejected outright; no
//! signed payload in this protocol carries one.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanonicalError {
    #[error("non-integer number in canonical payload")]
    NonIntegerNumber,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialise `value` to its canonical JSON text.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    canonicalize(&serde_json::to_value(value)?)
}

/// Canonicalise an already-parsed JSON value.
pub fn canonicalize(value: &Value) -> Result<String, CanonicalError> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                return Err(CanonicalError::NonIntegerNumber);
            }
        }
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // RFC 8785: member ordering is by UTF-16 code units of the key.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

// ── HMAC-SHA-256 tags ─────────────────────────────────────────────────────────

type HmacSha256 = hmac::Hmac<sha2::Sha256>;

/// Base64 HMAC-SHA-256 over the canonical form of `value`.
pub fn hmac_tag<T: Serialize>(key: &[u8], value: &T) -> Result<String, CanonicalError> {
    Ok(hmac_tag_bytes(key, canonical_json(value)?.as_bytes()))
}

/// Base64 HMAC-SHA-256 over raw bytes.
pub fn hmac_tag_bytes(key: &[u8], data: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use hmac::Mac;

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA-256 accepts any key length");
    mac.update(data);
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Verify a base64 tag over the canonical form of `value`.
///
/// Comparison happens inside `Mac::verify_slice` (constant time). A malformed
/// tag or uncanonicalisable value verifies as false rather than erroring —
/// callers treat both identically.
pub fn hmac_verify<T: Serialize>(key: &[u8], value: &T, tag_b64: &str) -> bool {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use hmac::Mac;

    let Ok(canon) = canonical_json(value) else {
        return false;
    };
    let Ok(tag) = STANDARD.decode(tag_b64) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA-256 accepts any key length");
    mac.update(canon.as_bytes());
    mac.verify_slice(&tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_and_strips_whitespace() {
        let value = json!({"b": 2, "a": 1, "nested": {"z": true, "y": [1, 2, 3]}});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"a":1,"b":2,"nested":{"y":[1,2,3],"z":true}}"#
        );
    }

    #[test]
    fn sorts_by_utf16_code_units_not_code_points() {
        // U+10000 encodes as the surrogate pair D800 DC00, which sorts before
        // U+FB00 in UTF-16 order even though its code point is larger.
        let value = json!({"\u{FB00}": 1, "\u{10000}": 2});
        assert_eq!(
            canonicalize(&value).unwrap(),
            "{\"\u{10000}\":2,\"\u{FB00}\":1}"
        );
    }

    #[test]
    fn integers_are_minimal_decimals() {
        let value = json!({"n": 0, "m": -7, "big": 4294967296u64});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"big":4294967296,"m":-7,"n":0}"#
        );
    }

    #[test]
    fn floats_are_rejected() {
        assert!(matches!(
            canonicalize(&json!({"x": 1.5})),
            Err(CanonicalError::NonIntegerNumber)
        ));
    }

    #[test]
    fn identical_objects_yield_identical_tags() {
        let key = b"pairing-key";
        let a = hmac_tag(key, &json!({"one": 1, "two": "2"})).unwrap();
        let b = hmac_tag(key, &json!({"two": "2", "one": 1})).unwrap();
        assert_eq!(a, b);
        assert!(hmac_verify(key, &json!({"one": 1, "two": "2"}), &a));
        assert!(!hmac_verify(b"other-key", &json!({"one": 1, "two": "2"}), &a));
    }

    #[test]
    fn hmac_matches_rfc4231_vector() {
        // RFC 4231 test case 2.
        let tag = hmac_tag_bytes(b"Jefe", b"what do ya want for nothing?");
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        assert_eq!(
            hex::encode(STANDARD.decode(tag).unwrap()),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
