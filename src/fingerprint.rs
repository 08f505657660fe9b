//! Content fingerprints for cheap cross-store comparison.
//!
//! A fingerprint is `sha256:<hex_digest>` over the canonical JSON encoding of a
//! payload: object keys sorted recursively, no insignificant whitespace. Two
//! payloads that differ only in key order share a fingerprint.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::Result;

/// Algorithm prefix on every fingerprint.
pub const ALGORITHM: &str = "sha256";

/// Canonical JSON text for a value.
#[must_use]
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Strings serialize infallibly
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
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
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// Fingerprint a JSON payload.
#[must_use]
pub fn fingerprint(value: &Value) -> String {
    let digest = Sha256::digest(canonicalize(value).as_bytes());
    format!("{ALGORITHM}:{}", hex::encode(digest))
}

/// Fingerprint any serializable value (used for idempotency request matching).
///
/// # Errors
///
/// Returns error if the value cannot be represented as JSON
pub fn fingerprint_of<T: Serialize>(value: &T) -> Result<String> {
    Ok(fingerprint(&serde_json::to_value(value)?))
}
