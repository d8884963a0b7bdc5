//! Write buffering and transactions.
//!
//! [`BufferedStore`] keeps every write in a local [`Buffer`] until
//! [`BufferedStore::commit`], serving reads from its own view first.
//! [`TransactionalStore`] stacks buffered stores to provide nested
//! `begin`/`commit`/`rollback` on top of any store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::buffer::{Batch, Buffer, BufferedOp, CommitReport, FlushScope, commit_batch};
use crate::entry::{CasToken, Expiry, Item};
use crate::error::CacheError;
use crate::store::{AtomicBatch, Store};
use crate::utils::{apply_delta, format_counter, now_secs, parse_counter, validate_key, validate_keys};

/// Async locks keyed by cache key, created on first use and dropped when
/// nobody holds or waits for them.
#[derive(Default)]
struct KeyLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = self
            .table
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Lock several keys in sorted order so two batches never wait on each other.
    async fn lock_all(&self, keys: impl Iterator<Item = &str>) -> Vec<KeyGuard<'_>> {
        let mut keys: Vec<&str> = keys.collect();
        keys.sort_unstable();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }
}

struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.locks.table.lock();
        self.guard.take();
        // only the table's own handle left
        if table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.key);
        }
    }
}

/// A store that defers writes until `commit`.
///
/// Reads observe the buffer's own pending writes. Writes that depend on a
/// value read earlier (`add`, `replace`, `cas`, counters, `touch`) keep the
/// condition under which they were made and are re-checked against the
/// wrapped store at commit time.
///
/// The buffer is never locked while the wrapped store is being read, so
/// reads of different keys run concurrently. Writes to the same key are
/// serialized by a per-key lock; a write whose read raced with a flush,
/// commit or rollback is decided again against the new buffer.
pub struct BufferedStore {
    inner: Arc<dyn Store>,
    buffer: Mutex<Buffer>,
    locks: KeyLocks,
    commit_timeout: Option<Duration>,
}

impl BufferedStore {
    /// Buffer writes in front of `inner`.
    pub fn new(inner: Arc<dyn Store>) -> Self {
        BufferedStore {
            inner,
            buffer: Mutex::new(Buffer::new()),
            locks: KeyLocks::default(),
            commit_timeout: None,
        }
    }

    /// Fail commits that take longer than `timeout` with `CacheError::Timeout`.
    ///
    /// Ops that reached the wrapped store before the deadline stay applied.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = Some(timeout);
        self
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<dyn Store> {
        &self.inner
    }

    /// Number of keys with a pending write.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// The pending write for `key`, if any.
    pub fn pending_op(&self, key: &str) -> Option<BufferedOp> {
        self.buffer.lock().pending(key).cloned()
    }

    /// Apply every pending write to the wrapped store and reset the buffer.
    ///
    /// Individual rejected or failed writes are listed in the report. An
    /// `Err` means the commit could not run at all (flush rejected, timeout,
    /// or a failed atomic batch).
    pub async fn commit(&self) -> Result<CommitReport, CacheError> {
        let batch = self.buffer.lock().take_batch();
        if batch.is_empty() {
            return Ok(CommitReport::default());
        }

        let report = match self.commit_timeout {
            Some(limit) => {
                tokio::time::timeout(limit, commit_batch(self.inner.as_ref(), &batch))
                    .await
                    .map_err(|_| {
                        tracing::warn!(
                            "Commit timed out: store={}, ops={}, timeout_ms={}",
                            self.inner.name(),
                            batch.ops.len(),
                            limit.as_millis()
                        );
                        CacheError::Timeout(limit)
                    })??
            }
            None => commit_batch(self.inner.as_ref(), &batch).await?,
        };

        tracing::debug!(
            "Committed buffer: store={}, applied={}, failed={}, flush={}",
            self.inner.name(),
            report.applied,
            report.failed.len(),
            batch.flush.is_some()
        );
        Ok(report)
    }

    /// Drop every pending write without contacting the wrapped store.
    pub async fn rollback(&self) {
        let mut buffer = self.buffer.lock();
        tracing::debug!("Rolled back buffer: pending={}", buffer.len());
        buffer.clear();
    }

    /// The current value of `key` as seen through the buffer, with the
    /// buffer generation it was observed in.
    async fn view(&self, key: &str) -> Result<(u64, Option<Item>), CacheError> {
        let generation = {
            let buffer = self.buffer.lock();
            if let Some(known) = buffer.lookup(key) {
                return Ok((buffer.generation(), known.cloned()));
            }
            buffer.generation()
        };

        let item = self.inner.get(key).await?;
        let item = self.buffer.lock().record_read(generation, key, item);
        Ok((generation, item))
    }

    /// Run a conditional write on `key`.
    ///
    /// `decide` sees the current value and returns the caller's result plus
    /// the op to buffer, if any. It runs again if the buffer moved to a new
    /// generation while the value was being read.
    async fn guarded<T, F>(&self, key: &str, decide: F) -> Result<T, CacheError>
    where
        T: Send,
        F: Fn(Option<&Item>) -> (T, Option<BufferedOp>) + Send + Sync,
    {
        let _guard = self.locks.lock(key).await;
        loop {
            let (generation, current) = self.view(key).await?;
            let (result, op) = decide(current.as_ref());
            if self.record_in(generation, key, op) {
                return Ok(result);
            }
            tracing::debug!("Buffer moved on during read, retrying: key={}", key);
        }
    }

    /// Record `op` if the buffer is still in `generation`.
    fn record_in(&self, generation: u64, key: &str, op: Option<BufferedOp>) -> bool {
        let mut buffer = self.buffer.lock();
        if buffer.generation() != generation {
            return false;
        }
        if let Some(op) = op {
            record(&mut buffer, key, op);
        }
        true
    }

    /// Fold a checked batch into the buffer if it is still in `generation`.
    fn fold_in(&self, generation: u64, batch: &Batch) -> bool {
        let mut buffer = self.buffer.lock();
        if buffer.generation() != generation {
            return false;
        }
        if batch.flush.is_some() {
            buffer.flush();
        }
        for (key, op) in &batch.ops {
            record(&mut buffer, key, op.clone());
        }
        true
    }

    async fn counter(
        &self,
        key: &str,
        delta: i64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        validate_key(key)?;
        let past = expire.is_past(now_secs());

        self.guarded(key, |current| match current {
            None => {
                let next = apply_delta(initial, delta);
                let op = (!past).then(|| BufferedOp::Add {
                    value: format_counter(next),
                    expire,
                });
                (Some(next), op)
            }
            Some(item) => match parse_counter(&item.value) {
                None => (None, None),
                Some(current) => {
                    let next = apply_delta(current, delta);
                    // an existing counter keeps its expiration, as a direct increment does
                    let op = BufferedOp::Cas {
                        token: item.token.clone(),
                        value: format_counter(next),
                        expire: None,
                    };
                    (Some(next), Some(op))
                }
            },
        })
        .await
    }
}

/// Write `op` into the buffer with the view it leaves behind.
fn record(buffer: &mut Buffer, key: &str, op: BufferedOp) {
    let view = match &op {
        BufferedOp::Set { value, .. }
        | BufferedOp::Add { value, .. }
        | BufferedOp::Replace { value, .. }
        | BufferedOp::Cas { value, .. } => Some(value.clone()),
        BufferedOp::Delete | BufferedOp::Touch { .. } => None,
    };
    buffer.write(key, op, view);
}

fn guard_holds(op: &BufferedOp, current: Option<&Item>) -> bool {
    match op {
        BufferedOp::Set { .. } | BufferedOp::Delete => true,
        BufferedOp::Add { .. } => current.is_none(),
        BufferedOp::Replace { .. } | BufferedOp::Touch { .. } => current.is_some(),
        BufferedOp::Cas { token, .. } => current.is_some_and(|item| item.token == *token),
    }
}

#[async_trait]
impl Store for BufferedStore {
    fn name(&self) -> &'static str {
        "buffered"
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, CacheError> {
        validate_key(key)?;
        Ok(self.view(key).await?.1)
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Item>, CacheError> {
        validate_keys(keys)?;

        let (generation, unknown) = {
            let buffer = self.buffer.lock();
            let unknown: Vec<&str> = keys
                .iter()
                .copied()
                .filter(|key| buffer.lookup(key).is_none())
                .collect();
            (buffer.generation(), unknown)
        };
        let mut found = if unknown.is_empty() {
            HashMap::new()
        } else {
            self.inner.get_multi(&unknown).await?
        };

        let mut buffer = self.buffer.lock();
        let mut fetched: HashMap<&str, Option<Item>> = unknown
            .iter()
            .map(|key| (*key, buffer.record_read(generation, key, found.remove(*key))))
            .collect();

        Ok(keys
            .iter()
            .filter_map(|key| {
                let item = match fetched.remove(*key) {
                    Some(item) => item,
                    None => buffer.lookup(key).flatten().cloned(),
                };
                item.map(|item| (key.to_string(), item))
            })
            .collect())
    }

    async fn set(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        validate_key(key)?;
        let op = if expire.is_past(now_secs()) {
            BufferedOp::Delete
        } else {
            BufferedOp::Set { value, expire }
        };

        let _guard = self.locks.lock(key).await;
        record(&mut self.buffer.lock(), key, op);
        Ok(true)
    }

    async fn add(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        validate_key(key)?;
        let past = expire.is_past(now_secs());
        self.guarded(key, |current| {
            if current.is_some() {
                return (false, None);
            }
            let op = (!past).then(|| BufferedOp::Add {
                value: value.clone(),
                expire,
            });
            (true, op)
        })
        .await
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        validate_key(key)?;
        let past = expire.is_past(now_secs());
        self.guarded(key, |current| {
            if current.is_none() {
                return (false, None);
            }
            let op = if past {
                BufferedOp::Delete
            } else {
                BufferedOp::Replace {
                    value: value.clone(),
                    expire,
                }
            };
            (true, Some(op))
        })
        .await
    }

    async fn cas(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        validate_key(key)?;
        let past = expire.is_past(now_secs());
        self.guarded(key, |current| {
            if !current.is_some_and(|item| item.token == *token) {
                return (false, None);
            }
            let op = if past {
                BufferedOp::Delete
            } else {
                BufferedOp::Cas {
                    token: token.clone(),
                    value: value.clone(),
                    expire: Some(expire),
                }
            };
            (true, Some(op))
        })
        .await
    }

    async fn cas_keep_ttl(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        validate_key(key)?;
        self.guarded(key, |current| {
            if !current.is_some_and(|item| item.token == *token) {
                return (false, None);
            }
            let op = BufferedOp::Cas {
                token: token.clone(),
                value: value.clone(),
                expire: None,
            };
            (true, Some(op))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        self.guarded(key, |current| (current.is_some(), Some(BufferedOp::Delete)))
            .await
    }

    async fn increment(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        let delta = i64::try_from(offset).unwrap_or(i64::MAX);
        self.counter(key, delta, initial, expire).await
    }

    async fn decrement(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        let delta = i64::try_from(offset).map_or(i64::MIN, |offset| -offset);
        self.counter(key, delta, initial, expire).await
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool, CacheError> {
        validate_key(key)?;
        let past = expire.is_past(now_secs());
        self.guarded(key, |current| {
            if current.is_none() {
                return (false, None);
            }
            let op = if past {
                BufferedOp::Delete
            } else {
                BufferedOp::Touch { expire }
            };
            (true, Some(op))
        })
        .await
    }

    async fn flush(&self) -> Result<bool, CacheError> {
        self.buffer.lock().flush();
        Ok(true)
    }

    fn atomic_batch(&self) -> Option<&dyn AtomicBatch> {
        Some(self)
    }
}

#[async_trait]
impl AtomicBatch for BufferedStore {
    /// Fold a batch into this buffer, checking every guard against the
    /// current view first. Used when an inner transaction commits into an
    /// enclosing one.
    async fn apply_batch(&self, batch: &Batch) -> Result<Vec<String>, CacheError> {
        validate_keys(&batch.ops.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())?;
        if let Some(FlushScope::Prefix(prefix)) = &batch.flush {
            return Err(CacheError::operation(
                self.name(),
                "unsupported",
                format!("cannot flush prefix '{}' inside a buffer", prefix),
            ));
        }

        let _guards = self
            .locks
            .lock_all(batch.ops.iter().map(|(k, _)| k.as_str()))
            .await;
        loop {
            let generation = self.buffer.lock().generation();
            let mut moved = false;
            let mut rejected = Vec::new();
            for (key, op) in &batch.ops {
                let current = if batch.flush.is_some() {
                    None
                } else {
                    let (seen, current) = self.view(key).await?;
                    moved |= seen != generation;
                    current
                };
                if !guard_holds(op, current.as_ref()) {
                    rejected.push(key.clone());
                }
            }

            if moved {
                continue;
            }
            if !rejected.is_empty() {
                return Ok(rejected);
            }
            if self.fold_in(generation, batch) {
                return Ok(rejected);
            }
        }
    }
}

/// A store with nested transactions.
///
/// Outside a transaction every call goes straight to the wrapped store.
/// `begin` opens a transaction; while one is open, calls go to the
/// innermost transaction's buffer. Committing an inner transaction folds
/// its writes into the enclosing one, all or nothing; committing the
/// outermost writes through to the wrapped store.
pub struct TransactionalStore {
    inner: Arc<dyn Store>,
    levels: AsyncMutex<Vec<Arc<BufferedStore>>>,
    commit_timeout: Option<Duration>,
}

impl TransactionalStore {
    /// Wrap `inner` with no transaction open.
    pub fn new(inner: Arc<dyn Store>) -> Self {
        TransactionalStore {
            inner,
            levels: AsyncMutex::new(Vec::new()),
            commit_timeout: None,
        }
    }

    /// Bound each commit by `timeout`.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = Some(timeout);
        self
    }

    /// Open a transaction, nested inside the current one if any.
    pub async fn begin(&self) {
        let mut levels = self.levels.lock().await;
        let parent: Arc<dyn Store> = match levels.last() {
            Some(level) => level.clone(),
            None => self.inner.clone(),
        };

        let mut level = BufferedStore::new(parent);
        level.commit_timeout = self.commit_timeout;
        levels.push(Arc::new(level));
        tracing::debug!("Began transaction: depth={}", levels.len());
    }

    /// Commit the innermost transaction.
    pub async fn commit(&self) -> Result<CommitReport, CacheError> {
        let level = self.pop().await?;
        level.commit().await
    }

    /// Discard the innermost transaction.
    pub async fn rollback(&self) -> Result<(), CacheError> {
        let level = self.pop().await?;
        level.rollback().await;
        Ok(())
    }

    /// Whether a transaction is open.
    pub async fn in_transaction(&self) -> bool {
        !self.levels.lock().await.is_empty()
    }

    /// Number of open transactions.
    pub async fn depth(&self) -> usize {
        self.levels.lock().await.len()
    }

    async fn pop(&self) -> Result<Arc<BufferedStore>, CacheError> {
        let mut levels = self.levels.lock().await;
        let level = levels.pop().ok_or(CacheError::NoTransaction)?;
        tracing::debug!("Closing transaction: depth={}", levels.len() + 1);
        Ok(level)
    }

    async fn current(&self) -> Arc<dyn Store> {
        match self.levels.lock().await.last() {
            Some(level) => level.clone(),
            None => self.inner.clone(),
        }
    }
}

#[async_trait]
impl Store for TransactionalStore {
    fn name(&self) -> &'static str {
        "transactional"
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, CacheError> {
        self.current().await.get(key).await
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Item>, CacheError> {
        self.current().await.get_multi(keys).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.current().await.set(key, value, expire).await
    }

    async fn set_multi(
        &self,
        items: Vec<(String, Vec<u8>)>,
        expire: Expiry,
    ) -> Result<HashMap<String, bool>, CacheError> {
        self.current().await.set_multi(items, expire).await
    }

    async fn add(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.current().await.add(key, value, expire).await
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.current().await.replace(key, value, expire).await
    }

    async fn cas(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.current().await.cas(token, key, value, expire).await
    }

    async fn cas_keep_ttl(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        self.current().await.cas_keep_ttl(token, key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.current().await.delete(key).await
    }

    async fn delete_multi(&self, keys: &[&str]) -> Result<HashMap<String, bool>, CacheError> {
        self.current().await.delete_multi(keys).await
    }

    async fn increment(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        self.current()
            .await
            .increment(key, offset, initial, expire)
            .await
    }

    async fn decrement(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        self.current()
            .await
            .decrement(key, offset, initial, expire)
            .await
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool, CacheError> {
        self.current().await.touch(key, expire).await
    }

    async fn flush(&self) -> Result<bool, CacheError> {
        self.current().await.flush().await
    }
}
