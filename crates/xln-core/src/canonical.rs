//! Canonical encoding.
//!
//! Every hash in the off-chain domain is keccak256 over the canonical JSON
//! rendering of a structure: UTF-8, map keys sorted lexicographically,
//! big integers as decimal strings, floating point forbidden.
//!
//! `serde_json`'s default `Map` is BTree-backed, so object keys serialize in
//! sorted order; the walk below enforces the no-float rule and rejects any
//! value that cannot round-trip exactly.

use serde::Serialize;
use serde_json::Value;

use crate::error::XlnError;

/// Render `value` as canonical JSON bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, XlnError> {
    let v = serde_json::to_value(value).map_err(|e| XlnError::Encoding(e.to_string()))?;
    check_canonical(&v)?;
    serde_json::to_vec(&v).map_err(|e| XlnError::Encoding(e.to_string()))
}

/// Render `value` as a canonical JSON string.
pub fn canonical_string<T: Serialize>(value: &T) -> Result<String, XlnError> {
    let bytes = canonical_bytes(value)?;
    String::from_utf8(bytes).map_err(|e| XlnError::Encoding(e.to_string()))
}

fn check_canonical(v: &Value) -> Result<(), XlnError> {
    match v {
        Value::Number(n) => {
            if n.is_f64() {
                return Err(XlnError::FloatInCanonicalValue);
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_canonical(item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (_, item) in map {
                check_canonical(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
