//! Payload fingerprinting
//!
//! A fingerprint is a stable Sha256 over the payload content. Structured
//! payloads are canonicalized first (object keys sorted recursively) so a
//! key-order difference never produces a distinct hash. Raw payloads hash
//! their bytes directly.

use crate::types::{ChangePayload, Fingerprint};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Fingerprint a change payload
#[must_use]
pub fn fingerprint(payload: &ChangePayload) -> Fingerprint {
    match payload {
        ChangePayload::Structured(value) => {
            let mut canonical = String::new();
            write_canonical(value, &mut canonical);
            hash_bytes(canonical.as_bytes())
        }
        ChangePayload::Raw(text) => hash_bytes(text.as_bytes()),
    }
}

/// Fingerprint any serializable value
///
/// Values that cannot be represented as JSON yield a unique sentinel that is
/// never deduplicated; the condition is logged.
pub fn fingerprint_serializable<T: Serialize>(value: &T) -> Fingerprint {
    match serde_json::to_value(value) {
        Ok(json) => fingerprint(&ChangePayload::Structured(json)),
        Err(err) => {
            tracing::warn!("payload not hashable, issuing unique sentinel: {err}");
            sentinel()
        }
    }
}

/// A fingerprint guaranteed to never match any other
#[must_use]
pub fn sentinel() -> Fingerprint {
    Fingerprint(format!("unhashable-{}", Ulid::new()))
}

/// Whether a fingerprint is a non-deduplicable sentinel
#[inline]
#[must_use]
pub fn is_sentinel(fingerprint: &Fingerprint) -> bool {
    fingerprint.as_str().starts_with("unhashable-")
}

fn hash_bytes(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint(hex::encode(hasher.finalize()))
}

// Canonical form: JSON with object keys emitted in sorted order at every
// nesting level. Map iteration order therefore cannot leak into the hash.
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
                write_canonical(&map[*key], out);
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
        other => out.push_str(&other.to_string()),
    }
}
