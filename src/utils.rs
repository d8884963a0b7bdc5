//! Shared utilities for the cache library.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CacheError;

/// Longest key accepted by any store, in bytes.
pub const MAX_KEY_LEN: usize = 250;

/// Get the current time in milliseconds since UNIX epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Get the current time in seconds since UNIX epoch.
pub fn now_secs() -> i64 {
    now_ms() / 1000
}

/// Reject keys no backend can store.
///
/// Keys must be non-empty, at most [`MAX_KEY_LEN`] bytes and free of
/// whitespace and control characters.
pub fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::invalid_key(key, "key is empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CacheError::invalid_key(key, "key is longer than 250 bytes"));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CacheError::invalid_key(
            key,
            "key contains whitespace or control characters",
        ));
    }
    Ok(())
}

/// Validate a caller's key that a decorator stores with `extra` more bytes
/// around it, such as a namespace prefix or a lock suffix.
///
/// Errors name the caller's key, not the derived one.
pub fn validate_derived_key(
    key: &str,
    extra: usize,
    reason: &'static str,
) -> Result<(), CacheError> {
    validate_key(key)?;
    if key.len() + extra > MAX_KEY_LEN {
        return Err(CacheError::invalid_key(key, reason));
    }
    Ok(())
}

/// Validate every key of a batch before any of them is sent anywhere.
pub fn validate_keys<K: AsRef<str>>(keys: &[K]) -> Result<(), CacheError> {
    keys.iter().try_for_each(|k| validate_key(k.as_ref()))
}

/// Parse a stored counter payload.
///
/// Counters are ASCII decimal. Anything else is not a counter.
pub fn parse_counter(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

/// Encode a counter payload.
pub fn format_counter(value: u64) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Apply an increment (`delta >= 0`) or decrement (`delta < 0`) to a counter.
///
/// Decrements saturate at zero, increments wrap like a 64-bit counter.
pub fn apply_delta(current: u64, delta: i64) -> u64 {
    if delta >= 0 {
        current.wrapping_add(delta as u64)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}
