use async_trait::async_trait;
use std::collections::HashMap;

use crate::buffer::Batch;
use crate::entry::{CasToken, Expiry, Item};
use crate::error::CacheError;
use crate::utils::validate_keys;

/// A store is a common interface for reading, writing and deleting key-value pairs.
///
/// Values are opaque byte payloads. Every store, whether a backend or a
/// decorator wrapping another store, honors the same semantics:
///
/// - a miss is `Ok(None)`, never an error and never confused with an empty payload
/// - expirations use the [`Expiry`] encoding
/// - a [`CasToken`] from a read only matches until the entry is written again
/// - backend failures surface as [`CacheError::OperationFailed`]
///
/// Multi-key operations have default implementations that loop over the
/// single-key ones. Stores with a native batch primitive override them.
#[async_trait]
pub trait Store: Send + Sync {
    /// A name for metrics/tracing.
    ///
    /// # Example
    /// - "memory"
    /// - "redis"
    /// - "sharded"
    fn name(&self) -> &'static str;

    /// Return the cached item, `None` on a miss.
    async fn get(&self, key: &str) -> Result<Option<Item>, CacheError>;

    /// Return the hits among `keys`. Missing keys are simply absent from the map.
    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Item>, CacheError> {
        validate_keys(keys)?;
        let mut items = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = self.get(key).await? {
                items.insert(key.to_string(), item);
            }
        }
        Ok(items)
    }

    /// Store the value, overwriting whatever was there.
    async fn set(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError>;

    /// Store many values with one expiration. Returns per-key success.
    async fn set_multi(
        &self,
        items: Vec<(String, Vec<u8>)>,
        expire: Expiry,
    ) -> Result<HashMap<String, bool>, CacheError> {
        validate_keys(&items.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())?;
        let mut results = HashMap::with_capacity(items.len());
        for (key, value) in items {
            let ok = self.set(&key, value, expire).await?;
            results.insert(key, ok);
        }
        Ok(results)
    }

    /// Store the value only if the key does not exist yet.
    async fn add(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError>;

    /// Store the value only if the key already exists.
    async fn replace(&self, key: &str, value: Vec<u8>, expire: Expiry)
    -> Result<bool, CacheError>;

    /// Store the value only if the entry still matches `token`.
    async fn cas(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError>;

    /// Like [`Store::cas`], but the entry keeps the expiration it already has.
    ///
    /// Counter updates made through a buffer commit this way, so they leave
    /// the TTL alone just like a direct increment does. Stores that cannot
    /// keep an expiration in place fail with `unsupported`.
    async fn cas_keep_ttl(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        let _ = (token, value);
        Err(CacheError::operation(
            self.name(),
            "unsupported",
            format!("cannot keep the expiration of '{}' on cas", key),
        ))
    }

    /// Remove the key. Returns whether an entry was removed; an absent key is `Ok(false)`.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove many keys. Returns per-key results like [`Store::delete`].
    async fn delete_multi(&self, keys: &[&str]) -> Result<HashMap<String, bool>, CacheError> {
        validate_keys(keys)?;
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            let deleted = self.delete(key).await?;
            results.insert(key.to_string(), deleted);
        }
        Ok(results)
    }

    /// Atomically add `offset` to a counter.
    ///
    /// An absent counter starts at `initial` and is then incremented once.
    /// Returns the new value, or `None` if the stored value is not a counter.
    async fn increment(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError>;

    /// Atomically subtract `offset` from a counter, saturating at zero.
    ///
    /// An absent counter starts at `initial` and is then decremented once.
    async fn decrement(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError>;

    /// Change the expiration of an existing entry without touching its value.
    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool, CacheError>;

    /// Remove every entry reachable through this store handle.
    async fn flush(&self) -> Result<bool, CacheError>;

    /// Prefix enumeration capability, if this store has one.
    fn prefix_flush(&self) -> Option<&dyn PrefixFlush> {
        None
    }

    /// All-or-nothing batch capability, if this store has one.
    fn atomic_batch(&self) -> Option<&dyn AtomicBatch> {
        None
    }
}

/// Stores that can enumerate their keys by prefix and delete the matches.
///
/// Static-prefix collections need this to flush.
#[async_trait]
pub trait PrefixFlush: Send + Sync {
    /// Delete every entry whose key starts with `prefix`.
    async fn flush_prefix(&self, prefix: &str) -> Result<bool, CacheError>;
}

/// Stores that can apply a batch of writes as one transaction.
#[async_trait]
pub trait AtomicBatch: Send + Sync {
    /// Apply the whole batch or nothing.
    ///
    /// Returns the keys whose guard did not hold. When the list is non-empty
    /// nothing was written.
    async fn apply_batch(&self, batch: &Batch) -> Result<Vec<String>, CacheError>;
}
