//! Namespaced views over a parent store.
//!
//! A [`Collection`] maps every key into a private sub-keyspace of its parent
//! by prefixing it, and can flush that sub-keyspace without touching the
//! rest of the parent. Two strategies exist:
//!
//! - [`PrefixStrategy::Static`]: prefix `"{name}:"`. Flushing deletes every
//!   parent key with that prefix, so the parent must support
//!   [`PrefixFlush`].
//! - [`PrefixStrategy::Epoch`]: prefix `"{name}:{epoch}:"`, with the epoch
//!   kept in the parent under `"{name}:epoch"`. Flushing increments the
//!   epoch; entries under older prefixes become unreachable and are left to
//!   the parent's own expiry and eviction.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::{Batch, BufferedOp, FlushScope};
use crate::entry::{CasToken, Expiry, Item};
use crate::error::CacheError;
use crate::store::{AtomicBatch, PrefixFlush, Store};
use crate::utils::{format_counter, parse_counter, validate_derived_key, validate_key, validate_keys};

/// How a collection derives its prefix and flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixStrategy {
    /// Fixed prefix, flushed by enumerating and deleting matching keys.
    Static,
    /// Generation-numbered prefix, flushed by moving to the next generation.
    Epoch,
}

/// A namespaced view over a parent store.
///
/// A collection is itself a [`Store`], so collections nest and can be
/// wrapped by any other decorator. It does not own its parent's data: the
/// epoch of an epoch-based collection lives in the parent and outlives the
/// collection handle.
pub struct Collection {
    parent: Arc<dyn Store>,
    name: String,
    strategy: PrefixStrategy,
    /// Highest epoch this handle has observed, 0 before first use.
    epoch: AtomicU64,
}

impl Collection {
    /// Create a collection, picking the static strategy when the parent can
    /// flush by prefix and the epoch strategy otherwise.
    ///
    /// # Example
    /// ```ignore
    /// let memory: Arc<dyn Store> = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
    /// let users = Collection::new(memory.clone(), "users")?;
    /// users.set("user:1", b"Alice".to_vec(), Expiry::NEVER).await?;
    /// users.flush().await?;
    /// ```
    pub fn new(parent: Arc<dyn Store>, name: &str) -> Result<Self, CacheError> {
        let strategy = if parent.prefix_flush().is_some() {
            PrefixStrategy::Static
        } else {
            PrefixStrategy::Epoch
        };
        Self::with_strategy(parent, name, strategy)
    }

    /// Create a collection with an explicit strategy.
    ///
    /// A static collection over a parent without [`PrefixFlush`] works for
    /// everything except `flush`, which fails with `OperationFailed`.
    pub fn with_strategy(
        parent: Arc<dyn Store>,
        name: &str,
        strategy: PrefixStrategy,
    ) -> Result<Self, CacheError> {
        validate_key(name)?;
        if name.contains(':') {
            return Err(CacheError::invalid_key(
                name,
                "collection names cannot contain ':'",
            ));
        }

        Ok(Collection {
            parent,
            name: name.to_string(),
            strategy,
            epoch: AtomicU64::new(0),
        })
    }

    /// The collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The prefix strategy in use.
    pub fn strategy(&self) -> PrefixStrategy {
        self.strategy
    }

    /// The highest epoch observed so far, `None` for static collections.
    pub fn epoch(&self) -> Option<u64> {
        match self.strategy {
            PrefixStrategy::Static => None,
            PrefixStrategy::Epoch => Some(self.epoch.load(Ordering::SeqCst)),
        }
    }

    fn control_key(&self) -> String {
        format!("{}:epoch", self.name)
    }

    /// Read the active epoch from the parent, creating it on first use.
    ///
    /// Never goes below an epoch this handle has already seen, even if the
    /// control key was evicted or reset in the meantime.
    pub async fn current_epoch(&self) -> Result<u64, CacheError> {
        let control = self.control_key();
        let known = self.epoch.load(Ordering::SeqCst);

        let remote = match self.parent.get(&control).await? {
            Some(item) => parse_counter(&item.value),
            None => {
                let start = known.max(1);
                if self
                    .parent
                    .add(&control, format_counter(start), Expiry::NEVER)
                    .await?
                {
                    tracing::debug!(
                        "Initialized collection epoch: collection={}, epoch={}",
                        self.name,
                        start
                    );
                    Some(start)
                } else {
                    // Someone else created it first
                    match self.parent.get(&control).await? {
                        Some(item) => parse_counter(&item.value),
                        None => Some(start),
                    }
                }
            }
        };

        let remote = match remote {
            Some(epoch) => epoch,
            None => {
                tracing::warn!(
                    "Collection epoch is not a counter, keeping local epoch: collection={}",
                    self.name
                );
                known.max(1)
            }
        };
        if remote < known {
            tracing::warn!(
                "Collection epoch went backwards, keeping local epoch: collection={}, remote={}, local={}",
                self.name,
                remote,
                known
            );
        }

        let epoch = remote.max(known).max(1);
        self.epoch.fetch_max(epoch, Ordering::SeqCst);
        Ok(epoch)
    }

    /// The prefix currently applied to keys.
    pub async fn prefix(&self) -> Result<String, CacheError> {
        match self.strategy {
            PrefixStrategy::Static => Ok(format!("{}:", self.name)),
            PrefixStrategy::Epoch => {
                let epoch = self.current_epoch().await?;
                Ok(format!("{}:{}:", self.name, epoch))
            }
        }
    }

    async fn key(&self, key: &str) -> Result<String, CacheError> {
        prefixed(&self.prefix().await?, key)
    }

    async fn keys(&self, keys: &[&str]) -> Result<(String, Vec<String>), CacheError> {
        validate_keys(keys)?;
        let prefix = self.prefix().await?;
        let prefixed = keys
            .iter()
            .map(|k| prefixed(&prefix, k))
            .collect::<Result<Vec<_>, CacheError>>()?;
        Ok((prefix, prefixed))
    }

    /// The batch to hand the parent for `batch`, plus the epoch it moves to.
    ///
    /// A flush of an epoch collection becomes a guarded write of the next
    /// epoch, so it lands in the same all-or-nothing step as the ops.
    async fn parent_batch(
        &self,
        batch: &Batch,
    ) -> Result<(String, Batch, Option<u64>), CacheError> {
        if self.strategy == PrefixStrategy::Epoch && batch.flush == Some(FlushScope::All) {
            let current = self.current_epoch().await?;
            let control = self.control_key();
            let stored = self.parent.get(&control).await?;

            let (next, op) = match &stored {
                Some(item) => {
                    let Some(remote) = parse_counter(&item.value) else {
                        return Err(CacheError::operation(
                            "collection",
                            "flush",
                            "collection epoch is not a counter",
                        ));
                    };
                    let next = remote.max(current) + 1;
                    (
                        next,
                        BufferedOp::Cas {
                            token: item.token.clone(),
                            value: format_counter(next),
                            expire: None,
                        },
                    )
                }
                None => (
                    current + 1,
                    BufferedOp::Add {
                        value: format_counter(current + 1),
                        expire: Expiry::NEVER,
                    },
                ),
            };

            let prefix = format!("{}:{}:", self.name, next);
            let mut ops = prefix_ops(&prefix, &batch.ops)?;
            ops.push((control, op));
            return Ok((prefix, Batch { flush: None, ops }, Some(next)));
        }

        let prefix = self.prefix().await?;
        let flush = batch.flush.as_ref().map(|scope| match scope {
            FlushScope::All => FlushScope::Prefix(prefix.clone()),
            FlushScope::Prefix(inner) => FlushScope::Prefix(format!("{}{}", prefix, inner)),
        });
        let ops = prefix_ops(&prefix, &batch.ops)?;
        Ok((prefix, Batch { flush, ops }, None))
    }

    async fn bump_epoch(&self) -> Result<bool, CacheError> {
        let control = self.control_key();
        let current = self.current_epoch().await?;

        let Some(mut next) = self
            .parent
            .increment(&control, 1, current, Expiry::NEVER)
            .await?
        else {
            tracing::warn!(
                "Failed to bump collection epoch: collection={}, epoch={}",
                self.name,
                current
            );
            return Ok(false);
        };

        if next <= current {
            // The control key fell behind this handle, push it past what we used
            match self
                .parent
                .increment(&control, current + 1 - next, current, Expiry::NEVER)
                .await?
            {
                Some(caught_up) => next = caught_up,
                None => return Ok(false),
            }
        }

        let next = next.max(current + 1);
        self.epoch.fetch_max(next, Ordering::SeqCst);
        tracing::debug!(
            "Bumped collection epoch: collection={}, from={}, to={}",
            self.name,
            current,
            next
        );
        Ok(true)
    }
}

/// `prefix` + `key`, rejecting keys that only become too long once prefixed.
fn prefixed(prefix: &str, key: &str) -> Result<String, CacheError> {
    validate_derived_key(
        key,
        prefix.len(),
        "key is longer than 250 bytes once the collection prefix is added",
    )?;
    Ok(format!("{}{}", prefix, key))
}

fn prefix_ops(
    prefix: &str,
    ops: &[(String, BufferedOp)],
) -> Result<Vec<(String, BufferedOp)>, CacheError> {
    ops.iter()
        .map(|(k, op)| Ok::<_, CacheError>((prefixed(prefix, k)?, op.clone())))
        .collect()
}

fn strip_keys<V>(prefix: &str, map: HashMap<String, V>) -> HashMap<String, V> {
    map.into_iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix).map(|k| (k.to_string(), v)))
        .collect()
}

#[async_trait]
impl Store for Collection {
    fn name(&self) -> &'static str {
        "collection"
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, CacheError> {
        self.parent.get(&self.key(key).await?).await
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Item>, CacheError> {
        let (prefix, prefixed) = self.keys(keys).await?;
        let refs: Vec<&str> = prefixed.iter().map(String::as_str).collect();

        let items = self.parent.get_multi(&refs).await?;
        Ok(strip_keys(&prefix, items))
    }

    async fn set(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.parent.set(&self.key(key).await?, value, expire).await
    }

    async fn set_multi(
        &self,
        items: Vec<(String, Vec<u8>)>,
        expire: Expiry,
    ) -> Result<HashMap<String, bool>, CacheError> {
        validate_keys(&items.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())?;
        let prefix = self.prefix().await?;
        let prefixed = items
            .into_iter()
            .map(|(k, v)| Ok::<_, CacheError>((prefixed(&prefix, &k)?, v)))
            .collect::<Result<Vec<_>, _>>()?;

        let results = self.parent.set_multi(prefixed, expire).await?;
        Ok(strip_keys(&prefix, results))
    }

    async fn add(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.parent.add(&self.key(key).await?, value, expire).await
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.parent.replace(&self.key(key).await?, value, expire).await
    }

    async fn cas(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.parent
            .cas(token, &self.key(key).await?, value, expire)
            .await
    }

    async fn cas_keep_ttl(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        self.parent
            .cas_keep_ttl(token, &self.key(key).await?, value)
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.parent.delete(&self.key(key).await?).await
    }

    async fn delete_multi(&self, keys: &[&str]) -> Result<HashMap<String, bool>, CacheError> {
        let (prefix, prefixed) = self.keys(keys).await?;
        let refs: Vec<&str> = prefixed.iter().map(String::as_str).collect();

        let results = self.parent.delete_multi(&refs).await?;
        Ok(strip_keys(&prefix, results))
    }

    async fn increment(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        self.parent
            .increment(&self.key(key).await?, offset, initial, expire)
            .await
    }

    async fn decrement(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        self.parent
            .decrement(&self.key(key).await?, offset, initial, expire)
            .await
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool, CacheError> {
        self.parent.touch(&self.key(key).await?, expire).await
    }

    async fn flush(&self) -> Result<bool, CacheError> {
        match self.strategy {
            PrefixStrategy::Static => {
                let Some(enumerate) = self.parent.prefix_flush() else {
                    return Err(CacheError::operation(
                        "collection",
                        "unsupported",
                        format!(
                            "parent store '{}' cannot flush by prefix",
                            self.parent.name()
                        ),
                    ));
                };
                enumerate.flush_prefix(&format!("{}:", self.name)).await
            }
            PrefixStrategy::Epoch => self.bump_epoch().await,
        }
    }

    fn prefix_flush(&self) -> Option<&dyn PrefixFlush> {
        self.parent.prefix_flush().map(|_| self as &dyn PrefixFlush)
    }

    fn atomic_batch(&self) -> Option<&dyn AtomicBatch> {
        self.parent.atomic_batch().map(|_| self as &dyn AtomicBatch)
    }
}

#[async_trait]
impl PrefixFlush for Collection {
    async fn flush_prefix(&self, prefix: &str) -> Result<bool, CacheError> {
        let Some(enumerate) = self.parent.prefix_flush() else {
            return Ok(false);
        };
        enumerate
            .flush_prefix(&format!("{}{}", self.prefix().await?, prefix))
            .await
    }
}

#[async_trait]
impl AtomicBatch for Collection {
    /// Applies the batch to the parent under this collection's prefix.
    ///
    /// A flush stays inside the same parent batch: a static collection
    /// narrows it to its own prefix, an epoch collection turns it into a
    /// guarded move to the next epoch. A rejected batch therefore leaves the
    /// collection exactly as it was.
    async fn apply_batch(&self, batch: &Batch) -> Result<Vec<String>, CacheError> {
        let Some(atomic) = self.parent.atomic_batch() else {
            return Err(CacheError::operation(
                "collection",
                "unsupported",
                "parent store cannot apply atomic batches",
            ));
        };
        validate_keys(&batch.ops.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())?;

        let (prefix, parent_batch, next_epoch) = self.parent_batch(batch).await?;
        let rejected = atomic.apply_batch(&parent_batch).await?;

        if rejected.is_empty() {
            if let Some(next) = next_epoch {
                self.epoch.fetch_max(next, Ordering::SeqCst);
                tracing::debug!(
                    "Bumped collection epoch in batch: collection={}, to={}",
                    self.name,
                    next
                );
            }
        }
        Ok(rejected
            .into_iter()
            .map(|k| match k.strip_prefix(&prefix) {
                Some(stripped) => stripped.to_string(),
                None => k,
            })
            .collect())
    }
}
