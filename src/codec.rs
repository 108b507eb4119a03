//! Value codec: converts bot state to and from the opaque bytes stored in
//! each row's `value` column.
//!
//! Storage never looks inside the bytes; this module is the only place that
//! interprets them.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::DatabaseError;

/// Encode a state value. `key` is only used to label errors.
pub fn encode(key: &str, value: &Value) -> Result<Vec<u8>, DatabaseError> {
    serde_json::to_vec(value).map_err(|e| DatabaseError::Encoding {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Decode bytes previously produced by [`encode`].
///
/// Malformed input is reported as corruption, never replaced with a default.
pub fn decode(key: &str, bytes: &[u8]) -> Result<Value, DatabaseError> {
    serde_json::from_slice(bytes).map_err(|e| DatabaseError::Decoding {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Encode any serializable host type.
pub fn encode_typed<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, DatabaseError> {
    let value = serde_json::to_value(value).map_err(|e| DatabaseError::Encoding {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    encode(key, &value)
}

/// Decode bytes into a host type.
pub fn decode_typed<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, DatabaseError> {
    let value = decode(key, bytes)?;
    serde_json::from_value(value).map_err(|e| DatabaseError::Decoding {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Null, `{}`, `[]` and `""` are "empty" for skip-null filtering.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
