// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Canonical JSON serialization and spec hashing.
//!
//! `generation` must be bumped iff the spec actually changed, so the hash is
//! computed over a canonical form with object keys sorted recursively. Two
//! specs differing only in map order hash identically and do not trigger a
//! new generation.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value with object keys sorted recursively.
///
/// Array order is preserved; only object key order is normalized.
///
/// # Example
///
/// ```rust
/// use converge::canonical::canonicalize;
/// use serde_json::json;
///
/// let a = canonicalize(&json!({"b": 1, "a": {"y": 2, "x": 3}}));
/// let b = canonicalize(&json!({"a": {"x": 3, "y": 2}, "b": 1}));
/// assert_eq!(a, b);
/// ```
#[must_use]
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 hex digest over the canonical serialization of a spec.
///
/// Produces a 64-character lowercase hex string.
#[must_use]
pub fn spec_hash(spec: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(spec).as_bytes());
    format!("{:x}", hasher.finalize())
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
                // serde_json string escaping for the key
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

#[cfg(test)]
#[path = "canonical_tests.rs"]
mod canonical_tests;
