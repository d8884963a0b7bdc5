use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::buffer::{Batch, BufferedOp, FlushScope};
use crate::entry::{CasToken, Expiry, Item};
use crate::error::CacheError;
use crate::store::{AtomicBatch, PrefixFlush, Store};
use crate::utils::{apply_delta, format_counter, now_secs, parse_counter, validate_key, validate_keys};

/// Configuration for MemoryStore.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Total payload bytes the store may hold before it evicts.
    ///
    /// Default: 64 MiB
    pub max_size: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        MemoryStoreConfig {
            max_size: 64 * 1024 * 1024,
        }
    }
}

/// Internal stored entry with expiration time.
#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    /// Unix seconds, `None` for entries that never expire.
    expire_at: Option<i64>,
    version: u64,
}

impl Slot {
    fn size(&self) -> u64 {
        self.value.len() as u64
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }

    fn item(&self) -> Item {
        Item::new(self.value.clone(), CasToken::from_version(self.version))
    }
}

/// Entries in recency order plus the running size of their payloads.
struct State {
    entries: LruCache<String, Slot>,
    size: u64,
    max_size: u64,
    next_version: u64,
}

impl State {
    /// Live entry without touching recency. Expired entries are dropped on sight.
    fn peek(&mut self, key: &str, now: i64) -> Option<&Slot> {
        let expired = self.entries.peek(key)?.is_expired(now);
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.peek(key)
    }

    /// Live entry, moved to the most recently used end.
    fn get(&mut self, key: &str, now: i64) -> Option<Item> {
        self.peek(key, now)?;
        self.entries.get(key).map(Slot::item)
    }

    fn write(&mut self, key: &str, value: Vec<u8>, expire_at: Option<i64>, now: i64) {
        if expire_at.is_some_and(|at| at <= now) {
            self.remove(key);
            return;
        }

        self.next_version += 1;
        let slot = Slot {
            value,
            expire_at,
            version: self.next_version,
        };
        let added = slot.size();
        if let Some(old) = self.entries.put(key.to_string(), slot) {
            self.size -= old.size();
        }
        self.size += added;
        self.evict();
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(old) => {
                self.size -= old.size();
                true
            }
            None => false,
        }
    }

    fn touch(&mut self, key: &str, expire_at: Option<i64>, now: i64) -> bool {
        if self.peek(key, now).is_none() {
            return false;
        }
        if expire_at.is_some_and(|at| at <= now) {
            return self.remove(key);
        }
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.expire_at = expire_at;
                true
            }
            None => false,
        }
    }

    fn counter(&mut self, key: &str, delta: i64, initial: u64, expire: Expiry, now: i64) -> Option<u64> {
        let (value, expire_at) = match self.peek(key, now) {
            Some(slot) => (apply_delta(parse_counter(&slot.value)?, delta), slot.expire_at),
            None => (apply_delta(initial, delta), expire.resolve(now)),
        };
        self.write(key, format_counter(value), expire_at, now);
        Some(value)
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            let Some((key, slot)) = self.entries.pop_lru() else {
                break;
            };
            self.size -= slot.size();
            tracing::debug!("Evicted entry: key={}, bytes={}", key, slot.size());
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }

    fn clear_prefix(&mut self, prefix: &str) -> usize {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    fn clear_scope(&mut self, scope: &FlushScope) {
        match scope {
            FlushScope::All => self.clear(),
            FlushScope::Prefix(prefix) => {
                self.clear_prefix(prefix);
            }
        }
    }

    /// Write if the entry still carries `token`. `expire: None` keeps its expiration.
    fn cas(
        &mut self,
        key: &str,
        token: &CasToken,
        value: Vec<u8>,
        expire: Option<Expiry>,
        now: i64,
    ) -> bool {
        let (version, kept) = match self.peek(key, now) {
            Some(slot) => (slot.version, slot.expire_at),
            None => return false,
        };
        if CasToken::from_version(version) != *token {
            return false;
        }
        let expire_at = match expire {
            Some(expire) => expire.resolve(now),
            None => kept,
        };
        self.write(key, value, expire_at, now);
        true
    }

    fn guard_holds(&mut self, key: &str, op: &BufferedOp, cleared: bool, now: i64) -> bool {
        let present = !cleared && self.peek(key, now).is_some();
        match op {
            BufferedOp::Set { .. } | BufferedOp::Delete => true,
            BufferedOp::Add { .. } => !present,
            BufferedOp::Replace { .. } | BufferedOp::Touch { .. } => present,
            BufferedOp::Cas { token, .. } => {
                present
                    && self
                        .peek(key, now)
                        .is_some_and(|slot| CasToken::from_version(slot.version) == *token)
            }
        }
    }

    fn apply(&mut self, key: &str, op: &BufferedOp, now: i64) {
        match op {
            BufferedOp::Set { value, expire }
            | BufferedOp::Add { value, expire }
            | BufferedOp::Replace { value, expire }
            | BufferedOp::Cas {
                value,
                expire: Some(expire),
                ..
            } => {
                self.write(key, value.clone(), expire.resolve(now), now);
            }
            BufferedOp::Cas {
                value, expire: None, ..
            } => {
                let kept = self.peek(key, now).and_then(|slot| slot.expire_at);
                self.write(key, value.clone(), kept, now);
            }
            BufferedOp::Delete => {
                self.remove(key);
            }
            BufferedOp::Touch { expire } => {
                self.touch(key, expire.resolve(now), now);
            }
        }
    }
}

/// In-process store bounded by a total payload size.
///
/// Every entry lives in one recency list. Reads and writes move an entry to
/// the most recently used end; when a write pushes the total past
/// `max_size`, entries are evicted from the least recently used end until
/// it fits again. Eviction is silent.
///
/// Collections created over the same `MemoryStore` share this pool and
/// budget, so pressure in one namespace can evict entries of another.
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create a new MemoryStore with the given configuration.
    pub fn new(config: MemoryStoreConfig) -> Self {
        MemoryStore {
            state: Mutex::new(State {
                entries: LruCache::unbounded(),
                size: 0,
                max_size: config.max_size,
                next_version: 0,
            }),
        }
    }

    /// Total payload bytes currently held.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Number of entries currently held, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn conditional_write(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
        want_present: bool,
    ) -> Result<bool, CacheError> {
        validate_key(key)?;
        let now = now_secs();
        let mut state = self.state.lock();
        if state.peek(key, now).is_some() != want_present {
            return Ok(false);
        }
        state.write(key, value, expire.resolve(now), now);
        Ok(true)
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, CacheError> {
        validate_key(key)?;
        Ok(self.state.lock().get(key, now_secs()))
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Item>, CacheError> {
        validate_keys(keys)?;
        let now = now_secs();
        let mut state = self.state.lock();
        Ok(keys
            .iter()
            .filter_map(|key| state.get(key, now).map(|item| (key.to_string(), item)))
            .collect())
    }

    async fn set(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        validate_key(key)?;
        let now = now_secs();
        self.state.lock().write(key, value, expire.resolve(now), now);
        Ok(true)
    }

    async fn set_multi(
        &self,
        items: Vec<(String, Vec<u8>)>,
        expire: Expiry,
    ) -> Result<HashMap<String, bool>, CacheError> {
        validate_keys(&items.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())?;
        let now = now_secs();
        let expire_at = expire.resolve(now);
        let mut state = self.state.lock();
        let mut results = HashMap::with_capacity(items.len());
        for (key, value) in items {
            state.write(&key, value, expire_at, now);
            results.insert(key, true);
        }
        Ok(results)
    }

    async fn add(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.conditional_write(key, value, expire, false)
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.conditional_write(key, value, expire, true)
    }

    async fn cas(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        validate_key(key)?;
        Ok(self
            .state
            .lock()
            .cas(key, token, value, Some(expire), now_secs()))
    }

    async fn cas_keep_ttl(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        validate_key(key)?;
        Ok(self.state.lock().cas(key, token, value, None, now_secs()))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        let mut state = self.state.lock();
        Ok(state.peek(key, now_secs()).is_some() && state.remove(key))
    }

    async fn delete_multi(&self, keys: &[&str]) -> Result<HashMap<String, bool>, CacheError> {
        validate_keys(keys)?;
        let now = now_secs();
        let mut state = self.state.lock();
        Ok(keys
            .iter()
            .map(|key| {
                let live = state.peek(key, now).is_some() && state.remove(key);
                (key.to_string(), live)
            })
            .collect())
    }

    async fn increment(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        validate_key(key)?;
        let delta = offset.min(i64::MAX as u64) as i64;
        Ok(self
            .state
            .lock()
            .counter(key, delta, initial, expire, now_secs()))
    }

    async fn decrement(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        validate_key(key)?;
        let delta = -(offset.min(i64::MAX as u64) as i64);
        Ok(self
            .state
            .lock()
            .counter(key, delta, initial, expire, now_secs()))
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool, CacheError> {
        validate_key(key)?;
        let now = now_secs();
        Ok(self.state.lock().touch(key, expire.resolve(now), now))
    }

    async fn flush(&self) -> Result<bool, CacheError> {
        self.state.lock().clear();
        Ok(true)
    }

    fn prefix_flush(&self) -> Option<&dyn PrefixFlush> {
        Some(self)
    }

    fn atomic_batch(&self) -> Option<&dyn AtomicBatch> {
        Some(self)
    }
}

#[async_trait]
impl PrefixFlush for MemoryStore {
    async fn flush_prefix(&self, prefix: &str) -> Result<bool, CacheError> {
        let removed = self.state.lock().clear_prefix(prefix);
        tracing::debug!("Flushed prefix: prefix={}, entries={}", prefix, removed);
        Ok(true)
    }
}

#[async_trait]
impl AtomicBatch for MemoryStore {
    async fn apply_batch(&self, batch: &Batch) -> Result<Vec<String>, CacheError> {
        validate_keys(&batch.ops.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())?;
        let now = now_secs();
        let mut state = self.state.lock();

        let rejected: Vec<String> = batch
            .ops
            .iter()
            .filter(|(key, op)| !state.guard_holds(key, op, batch.clears(key), now))
            .map(|(key, _)| key.clone())
            .collect();
        if !rejected.is_empty() {
            return Ok(rejected);
        }

        if let Some(scope) = &batch.flush {
            state.clear_scope(scope);
        }
        for (key, op) in &batch.ops {
            state.apply(key, op, now);
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_budget(max_size: u64) -> MemoryStore {
        MemoryStore::new(MemoryStoreConfig { max_size })
    }

    fn value(n: u32) -> Vec<u8> {
        // 13 bytes each
        format!("value{}:padded", n).into_bytes()
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryStore::new(MemoryStoreConfig::default());

        // Initially empty
        assert!(store.get("key1").await.unwrap().is_none());

        store.set("key1", b"value1".to_vec(), Expiry::NEVER).await.unwrap();
        let item = store.get("key1").await.unwrap().unwrap();
        assert_eq!(item.value, b"value1");

        assert!(store.delete("key1").await.unwrap());
        assert!(store.get("key1").await.unwrap().is_none());

        // Deleting again is not an error
        assert!(!store.delete("key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_falsy_payloads_are_hits() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        store.set("empty", Vec::new(), Expiry::NEVER).await.unwrap();
        store.set("zero", b"0".to_vec(), Expiry::NEVER).await.unwrap();

        assert_eq!(store.get("empty").await.unwrap().unwrap().value, b"");
        assert_eq!(store.get("zero").await.unwrap().unwrap().value, b"0");
    }

    #[tokio::test]
    async fn test_budget_evicts_least_recently_used() {
        let store = store_with_budget(26);

        store.set("key1", value(1), Expiry::NEVER).await.unwrap();
        store.set("key2", value(2), Expiry::NEVER).await.unwrap();
        assert_eq!(store.size(), 26);
        assert!(store.get("key1").await.unwrap().is_some());
        assert!(store.get("key2").await.unwrap().is_some());

        // key1 was read first, so it is the least recently used
        store.set("key3", value(3), Expiry::NEVER).await.unwrap();
        assert!(store.get("key1").await.unwrap().is_none());
        assert_eq!(store.get("key3").await.unwrap().unwrap().value, value(3));
        assert!(store.size() <= 26);
    }

    #[tokio::test]
    async fn test_read_refreshes_recency() {
        let store = store_with_budget(26);

        store.set("key1", value(1), Expiry::NEVER).await.unwrap();
        store.set("key2", value(2), Expiry::NEVER).await.unwrap();
        store.get("key1").await.unwrap();
        store.set("key3", value(3), Expiry::NEVER).await.unwrap();

        assert!(store.get("key1").await.unwrap().is_some());
        assert!(store.get("key2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_does_not_double_count() {
        let store = store_with_budget(26);

        store.set("key1", value(1), Expiry::NEVER).await.unwrap();
        store.set("key1", value(1), Expiry::NEVER).await.unwrap();
        store.set("key1", b"tiny".to_vec(), Expiry::NEVER).await.unwrap();
        assert_eq!(store.size(), 4);

        store.set("key2", value(2), Expiry::NEVER).await.unwrap();
        assert!(store.get("key1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retained_set_is_most_recent_within_budget() {
        let store = store_with_budget(13 * 4);
        for i in 0..10 {
            store
                .set(&format!("key{}", i), value(i), Expiry::NEVER)
                .await
                .unwrap();
            assert!(store.size() <= 13 * 4);
        }
        assert_eq!(store.keys(), vec!["key9", "key8", "key7", "key6"]);
    }

    #[tokio::test]
    async fn test_add_replace() {
        let store = MemoryStore::new(MemoryStoreConfig::default());

        assert!(!store.replace("k", b"a".to_vec(), Expiry::NEVER).await.unwrap());
        assert!(store.add("k", b"a".to_vec(), Expiry::NEVER).await.unwrap());
        assert!(!store.add("k", b"b".to_vec(), Expiry::NEVER).await.unwrap());
        assert!(store.replace("k", b"c".to_vec(), Expiry::NEVER).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"c");
    }

    #[tokio::test]
    async fn test_cas_token_invalidated_by_write() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        store.set("k", b"1".to_vec(), Expiry::NEVER).await.unwrap();

        let token = store.get("k").await.unwrap().unwrap().token;
        store.set("k", b"2".to_vec(), Expiry::NEVER).await.unwrap();
        assert!(!store.cas(&token, "k", b"3".to_vec(), Expiry::NEVER).await.unwrap());

        let token = store.get("k").await.unwrap().unwrap().token;
        assert!(store.cas(&token, "k", b"3".to_vec(), Expiry::NEVER).await.unwrap());
        assert!(!store.cas(&token, "k", b"4".to_vec(), Expiry::NEVER).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"3");

        assert!(!store.cas(&token, "missing", b"x".to_vec(), Expiry::NEVER).await.unwrap());
    }

    #[tokio::test]
    async fn test_counters() {
        let store = MemoryStore::new(MemoryStoreConfig::default());

        assert_eq!(store.increment("c", 1, 10, Expiry::NEVER).await.unwrap(), Some(11));
        assert_eq!(store.increment("c", 5, 10, Expiry::NEVER).await.unwrap(), Some(16));
        assert_eq!(store.decrement("c", 20, 0, Expiry::NEVER).await.unwrap(), Some(0));
        assert_eq!(store.decrement("d", 1, 5, Expiry::NEVER).await.unwrap(), Some(4));
        assert_eq!(store.get("d").await.unwrap().unwrap().value, b"4");

        store.set("text", b"abc".to_vec(), Expiry::NEVER).await.unwrap();
        assert_eq!(store.increment("text", 1, 0, Expiry::NEVER).await.unwrap(), None);
        assert_eq!(store.get("text").await.unwrap().unwrap().value, b"abc");
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        let past = Expiry::at_unix(now_secs() as u64 - 10);

        store.set("k", b"v".to_vec(), Expiry::NEVER).await.unwrap();
        store.set("k", b"v".to_vec(), past).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.size(), 0);

        store.set("k", b"v".to_vec(), Expiry::from_raw(60)).await.unwrap();
        assert!(store.touch("k", past).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.touch("k", Expiry::NEVER).await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_keeps_value_and_token() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        store.set("k", b"v".to_vec(), Expiry::from_raw(5)).await.unwrap();
        let before = store.get("k").await.unwrap().unwrap();

        assert!(store.touch("k", Expiry::NEVER).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_multi_operations() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        let results = store
            .set_multi(
                vec![("a".into(), b"1".to_vec()), ("b".into(), b"2".to_vec())],
                Expiry::NEVER,
            )
            .await
            .unwrap();
        assert!(results.values().all(|ok| *ok));

        let items = store.get_multi(&["a", "b", "c"]).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items["a"].value, b"1");

        let deleted = store.delete_multi(&["a", "c"]).await.unwrap();
        assert!(deleted["a"]);
        assert!(!deleted["c"]);
    }

    #[tokio::test]
    async fn test_invalid_key_fails_whole_batch() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        let result = store
            .set_multi(
                vec![("ok".into(), b"1".to_vec()), ("".into(), b"2".to_vec())],
                Expiry::NEVER,
            )
            .await;
        assert!(matches!(result, Err(CacheError::InvalidKey { .. })));
        assert!(store.get("ok").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_prefix_releases_size() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        store.set("users:1", b"aa".to_vec(), Expiry::NEVER).await.unwrap();
        store.set("users:2", b"bb".to_vec(), Expiry::NEVER).await.unwrap();
        store.set("orders:1", b"cc".to_vec(), Expiry::NEVER).await.unwrap();

        store.flush_prefix("users:").await.unwrap();
        assert_eq!(store.size(), 2);
        assert!(store.get("orders:1").await.unwrap().is_some());
        assert!(store.get("users:1").await.unwrap().is_none());

        store.flush().await.unwrap();
        assert!(store.is_empty());
        assert_eq!(store.size(), 0);
    }

    #[tokio::test]
    async fn test_atomic_batch_all_or_nothing() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        store.set("a", b"1".to_vec(), Expiry::NEVER).await.unwrap();
        let stale = store.get("a").await.unwrap().unwrap().token;
        store.set("a", b"2".to_vec(), Expiry::NEVER).await.unwrap();

        let batch = Batch {
            flush: None,
            ops: vec![
                (
                    "b".into(),
                    BufferedOp::Set {
                        value: b"x".to_vec(),
                        expire: Expiry::NEVER,
                    },
                ),
                (
                    "a".into(),
                    BufferedOp::Cas {
                        token: stale,
                        value: b"3".to_vec(),
                        expire: Some(Expiry::NEVER),
                    },
                ),
            ],
        };
        let rejected = store.apply_batch(&batch).await.unwrap();
        assert_eq!(rejected, vec!["a".to_string()]);
        assert!(store.get("b").await.unwrap().is_none());
        assert_eq!(store.get("a").await.unwrap().unwrap().value, b"2");
    }

    fn expire_at(store: &MemoryStore, key: &str) -> Option<i64> {
        store.state.lock().entries.peek(key).and_then(|slot| slot.expire_at)
    }

    #[tokio::test]
    async fn test_cas_keep_ttl_leaves_expiration() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        store.set("n", b"5".to_vec(), Expiry::from_raw(600)).await.unwrap();
        let before = expire_at(&store, "n");
        assert!(before.is_some());

        let token = store.get("n").await.unwrap().unwrap().token;
        assert!(store.cas_keep_ttl(&token, "n", b"6".to_vec()).await.unwrap());
        assert_eq!(store.get("n").await.unwrap().unwrap().value, b"6");
        assert_eq!(expire_at(&store, "n"), before);

        // the token moved on with the write
        assert!(!store.cas_keep_ttl(&token, "n", b"7".to_vec()).await.unwrap());
        assert!(!store.cas_keep_ttl(&token, "missing", b"1".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn test_atomic_batch_keep_ttl_cas() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        store.set("n", b"5".to_vec(), Expiry::from_raw(600)).await.unwrap();
        let before = expire_at(&store, "n");
        let token = store.get("n").await.unwrap().unwrap().token;

        let batch = Batch {
            flush: None,
            ops: vec![(
                "n".into(),
                BufferedOp::Cas {
                    token,
                    value: b"6".to_vec(),
                    expire: None,
                },
            )],
        };
        assert!(store.apply_batch(&batch).await.unwrap().is_empty());
        assert_eq!(store.get("n").await.unwrap().unwrap().value, b"6");
        assert_eq!(expire_at(&store, "n"), before);
    }

    #[tokio::test]
    async fn test_atomic_batch_prefix_flush() {
        let store = MemoryStore::new(MemoryStoreConfig::default());
        store.set("users:1", b"a".to_vec(), Expiry::NEVER).await.unwrap();
        store.set("users:2", b"b".to_vec(), Expiry::NEVER).await.unwrap();
        store.set("orders:1", b"c".to_vec(), Expiry::NEVER).await.unwrap();

        // the flush makes users:1 absent for the add guard, orders:1 stays present
        let rejected_batch = Batch {
            flush: Some(FlushScope::Prefix("users:".into())),
            ops: vec![(
                "orders:1".into(),
                BufferedOp::Add {
                    value: b"x".to_vec(),
                    expire: Expiry::NEVER,
                },
            )],
        };
        let rejected = store.apply_batch(&rejected_batch).await.unwrap();
        assert_eq!(rejected, vec!["orders:1".to_string()]);
        assert!(store.get("users:1").await.unwrap().is_some());
        assert!(store.get("users:2").await.unwrap().is_some());

        let batch = Batch {
            flush: Some(FlushScope::Prefix("users:".into())),
            ops: vec![(
                "users:1".into(),
                BufferedOp::Add {
                    value: b"x".to_vec(),
                    expire: Expiry::NEVER,
                },
            )],
        };
        assert!(store.apply_batch(&batch).await.unwrap().is_empty());
        assert_eq!(store.get("users:1").await.unwrap().unwrap().value, b"x");
        assert!(store.get("users:2").await.unwrap().is_none());
        assert_eq!(store.get("orders:1").await.unwrap().unwrap().value, b"c");
    }
}
