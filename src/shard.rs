//! Key-based partitioning across several stores.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use xxhash_rust::xxh64::xxh64;

use crate::entry::{CasToken, Expiry, Item};
use crate::error::CacheError;
use crate::store::{PrefixFlush, Store};
use crate::utils::validate_keys;

/// How keys are mapped onto shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardStrategy {
    /// `hash(key) % n`. Changing `n` remaps most keys.
    #[default]
    Modulo,
    /// Jump consistent hash. Growing from `n` to `n + 1` shards moves only
    /// about `1 / (n + 1)` of the keys, all onto the new shard.
    JumpConsistent,
}

/// The shard index of `key` among `shards` shards, `None` when there are none.
pub fn shard_for(key: &str, shards: usize, strategy: ShardStrategy) -> Option<usize> {
    if shards == 0 {
        return None;
    }
    let hash = xxh64(key.as_bytes(), 0);
    Some(match strategy {
        ShardStrategy::Modulo => (hash % shards as u64) as usize,
        ShardStrategy::JumpConsistent => jump_hash(hash, shards),
    })
}

/// Lamping and Veach, "A Fast, Minimal Memory, Consistent Hash Algorithm".
fn jump_hash(mut key: u64, buckets: usize) -> usize {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as usize
}

/// Routes every key to one of a fixed set of stores.
///
/// Single-key operations go straight to the key's shard. Multi-key
/// operations are split per shard, sent to all affected shards
/// concurrently, and merged.
///
/// Multi-key operations are not atomic across shards. When one shard fails,
/// the call returns that shard's error and the other shards' results are
/// dropped, but their writes and deletes stay applied.
pub struct ShardedStore {
    shards: Vec<Arc<dyn Store>>,
    strategy: ShardStrategy,
}

impl ShardedStore {
    /// Route over `shards`, which must not be empty.
    pub fn new(shards: Vec<Arc<dyn Store>>, strategy: ShardStrategy) -> Result<Self, CacheError> {
        if shards.is_empty() {
            return Err(CacheError::operation(
                "sharded",
                "config",
                "a sharded store needs at least one shard",
            ));
        }
        Ok(ShardedStore { shards, strategy })
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Always false, a sharded store has at least one shard.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// The shards, in routing order.
    pub fn shards(&self) -> &[Arc<dyn Store>] {
        &self.shards
    }

    /// Index of the shard owning `key`.
    pub fn shard_index(&self, key: &str) -> usize {
        // never empty, see `new`
        shard_for(key, self.shards.len(), self.strategy).unwrap_or(0)
    }

    /// The shard owning `key`.
    pub fn shard(&self, key: &str) -> &Arc<dyn Store> {
        &self.shards[self.shard_index(key)]
    }

    /// Split `items` into one group per shard, keeping input order within a group.
    fn partition<T>(&self, items: Vec<T>, key: impl Fn(&T) -> &str) -> Vec<Vec<T>> {
        let mut groups: Vec<Vec<T>> = (0..self.shards.len()).map(|_| Vec::new()).collect();
        for item in items {
            let index = self.shard_index(key(&item));
            groups[index].push(item);
        }
        groups
    }
}

/// Merge per-shard results, returning the first error after every shard ran.
///
/// Every failing shard is logged with its index.
fn merge<V>(
    op: &'static str,
    results: Vec<(usize, Result<HashMap<String, V>, CacheError>)>,
) -> Result<HashMap<String, V>, CacheError> {
    let mut merged = HashMap::new();
    let mut first_error = None;
    for (index, result) in results {
        match result {
            Ok(part) => merged.extend(part),
            Err(e) => {
                tracing::warn!("Shard {} failed: shard={}, error={}", op, index, e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(merged),
    }
}

#[async_trait]
impl Store for ShardedStore {
    fn name(&self) -> &'static str {
        "sharded"
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, CacheError> {
        self.shard(key).get(key).await
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Item>, CacheError> {
        validate_keys(keys)?;
        let groups = self.partition(keys.to_vec(), |key| *key);

        let futures = groups
            .iter()
            .enumerate()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(index, keys)| {
                self.shards[index]
                    .get_multi(keys)
                    .map(move |result| (index, result))
            });
        merge("get_multi", join_all(futures).await)
    }

    async fn set(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.shard(key).set(key, value, expire).await
    }

    async fn set_multi(
        &self,
        items: Vec<(String, Vec<u8>)>,
        expire: Expiry,
    ) -> Result<HashMap<String, bool>, CacheError> {
        validate_keys(&items.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())?;
        let groups = self.partition(items, |(key, _)| key.as_str());

        let futures = groups
            .into_iter()
            .enumerate()
            .filter(|(_, items)| !items.is_empty())
            .map(|(index, items)| {
                self.shards[index]
                    .set_multi(items, expire)
                    .map(move |result| (index, result))
            });
        merge("set_multi", join_all(futures).await)
    }

    async fn add(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.shard(key).add(key, value, expire).await
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.shard(key).replace(key, value, expire).await
    }

    async fn cas(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.shard(key).cas(token, key, value, expire).await
    }

    async fn cas_keep_ttl(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        self.shard(key).cas_keep_ttl(token, key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.shard(key).delete(key).await
    }

    async fn delete_multi(&self, keys: &[&str]) -> Result<HashMap<String, bool>, CacheError> {
        validate_keys(keys)?;
        let groups = self.partition(keys.to_vec(), |key| *key);

        let futures = groups
            .iter()
            .enumerate()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(index, keys)| {
                self.shards[index]
                    .delete_multi(keys)
                    .map(move |result| (index, result))
            });
        merge("delete_multi", join_all(futures).await)
    }

    async fn increment(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        self.shard(key).increment(key, offset, initial, expire).await
    }

    async fn decrement(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        self.shard(key).decrement(key, offset, initial, expire).await
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool, CacheError> {
        self.shard(key).touch(key, expire).await
    }

    /// Flush every shard. Shards that flushed stay flushed when another fails.
    async fn flush(&self) -> Result<bool, CacheError> {
        let results = join_all(self.shards.iter().map(|shard| shard.flush())).await;

        let mut first_error = None;
        let mut all_flushed = true;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(flushed) => all_flushed &= flushed,
                Err(e) => {
                    tracing::warn!("Shard flush failed: shard={}, error={}", index, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(all_flushed),
        }
    }

    fn prefix_flush(&self) -> Option<&dyn PrefixFlush> {
        self.shards
            .iter()
            .all(|shard| shard.prefix_flush().is_some())
            .then_some(self as &dyn PrefixFlush)
    }
}

#[async_trait]
impl PrefixFlush for ShardedStore {
    async fn flush_prefix(&self, prefix: &str) -> Result<bool, CacheError> {
        let futures = self.shards.iter().filter_map(|shard| {
            shard
                .prefix_flush()
                .map(|enumerate| enumerate.flush_prefix(prefix))
        });

        let mut all_flushed = true;
        for result in join_all(futures).await {
            all_flushed &= result?;
        }
        Ok(all_flushed)
    }
}
