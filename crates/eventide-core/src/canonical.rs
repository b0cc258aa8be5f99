//! Canonical JSON serialization.
//!
//! Snapshot data and other integrity-sensitive payloads are written in a
//! canonical form: object keys sorted, `null` members and members holding
//! an empty object or array omitted. Two semantically equal states
//! therefore produce byte-identical output and identical digests. State
//! types restored from canonical data mark collection fields
//! `#[serde(default)]`.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Serializes `value` and normalizes it into canonical form.
///
/// # Errors
///
/// Returns the encoder error if `value` cannot be represented as JSON.
pub fn to_canonical_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, serde_json::Error> {
    Ok(canonicalize(serde_json::to_value(value)?))
}

/// Serializes `value` into a canonical JSON string.
///
/// # Errors
///
/// Returns the encoder error if `value` cannot be represented as JSON.
pub fn to_canonical_string<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&to_canonical_value(value)?)
}

/// Normalizes an already-built JSON value.
#[must_use]
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .filter(|(_, v)| !is_empty(v))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, v);
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Hex-encoded SHA-256 of the canonical encoding of `value`.
#[must_use]
pub fn digest(value: &Value) -> String {
    let canonical = canonicalize(value.clone());
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
