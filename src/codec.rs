//! Converting typed values to and from stored payloads.
//!
//! Stores only ever see bytes. A [`Codec`] is applied by callers at the
//! edge, before `set` and after `get`.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::CacheError;

/// Serialization strategy for cached values.
pub trait Codec: Send + Sync {
    /// Encode a value into a payload.
    fn encode<V: Serialize>(&self, value: &V) -> Result<Vec<u8>, CacheError>;

    /// Decode a payload back into a value.
    fn decode<V: DeserializeOwned>(&self, payload: &[u8]) -> Result<V, CacheError>;
}

/// JSON payloads via `serde_json`.
///
/// Counters written by `increment`/`decrement` are ASCII decimal, which is
/// valid JSON, so they decode as integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<V: Serialize>(&self, value: &V) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(value)
            .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e)))
    }

    fn decode<V: DeserializeOwned>(&self, payload: &[u8]) -> Result<V, CacheError> {
        serde_json::from_slice(payload)
            .map_err(|e| CacheError::Serialization(format!("Deserialization failed: {}", e)))
    }
}
