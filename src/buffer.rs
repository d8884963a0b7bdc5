//! Pending-write journal shared by the buffered and transactional stores.
//!
//! A [`Buffer`] records the latest pending write per key, in first-touch
//! order, together with what it has learned about each key (a value read
//! from the wrapped store, or a value written locally). Conditional writes
//! carry the guard captured when the key was first read, so applying them
//! later fails instead of overwriting state the buffer never observed.

use indexmap::IndexMap;
use std::collections::HashMap;

use crate::entry::{CasToken, Expiry, Item};
use crate::error::CacheError;
use crate::store::Store;

/// A write waiting in a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferedOp {
    /// Unconditional write.
    Set { value: Vec<u8>, expire: Expiry },
    /// Write only if the key is still absent.
    Add { value: Vec<u8>, expire: Expiry },
    /// Write only if the key still exists.
    Replace { value: Vec<u8>, expire: Expiry },
    /// Write only if the entry still matches the token captured at read time.
    ///
    /// `expire: None` keeps whatever expiration the entry has when the op is
    /// applied, the way counter updates do.
    Cas {
        token: CasToken,
        value: Vec<u8>,
        expire: Option<Expiry>,
    },
    /// Unconditional delete.
    Delete,
    /// Change the expiration of an existing entry.
    Touch { expire: Expiry },
}

impl BufferedOp {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            BufferedOp::Set { .. } => "set",
            BufferedOp::Add { .. } => "add",
            BufferedOp::Replace { .. } => "replace",
            BufferedOp::Cas { .. } => "cas",
            BufferedOp::Delete => "delete",
            BufferedOp::Touch { .. } => "touch",
        }
    }

    /// Whether applying this op depends on state observed earlier.
    pub fn is_conditional(&self) -> bool {
        !matches!(self, BufferedOp::Set { .. } | BufferedOp::Delete)
    }

    /// Fold a later write on the same key into this one.
    ///
    /// Unconditional writes replace whatever was pending. A conditional write
    /// keeps the guard of the op already pending and only takes its payload,
    /// so the first guard recorded for a key is the one checked at commit.
    /// A later write that keeps the expiration keeps the pending one.
    pub fn merge(self, next: BufferedOp) -> BufferedOp {
        match (self, next) {
            (_, next @ (BufferedOp::Set { .. } | BufferedOp::Delete)) => next,
            (
                BufferedOp::Touch { expire },
                BufferedOp::Cas {
                    token,
                    value,
                    expire: None,
                },
            ) => BufferedOp::Cas {
                token,
                value,
                expire: Some(expire),
            },
            // A touch only extended a read, the later op brings its own guard.
            (BufferedOp::Touch { .. }, next) => next,
            (BufferedOp::Delete, BufferedOp::Touch { .. }) => BufferedOp::Delete,
            (prev, BufferedOp::Touch { expire }) => prev.with_expire(expire),
            (prev, next) => match next.into_payload() {
                Some((value, expire)) => prev.with_payload(value, expire),
                None => prev,
            },
        }
    }

    fn into_payload(self) -> Option<(Vec<u8>, Option<Expiry>)> {
        match self {
            BufferedOp::Set { value, expire }
            | BufferedOp::Add { value, expire }
            | BufferedOp::Replace { value, expire } => Some((value, Some(expire))),
            BufferedOp::Cas { value, expire, .. } => Some((value, expire)),
            BufferedOp::Delete | BufferedOp::Touch { .. } => None,
        }
    }

    fn with_payload(self, value: Vec<u8>, expire: Option<Expiry>) -> BufferedOp {
        match self {
            BufferedOp::Set { expire: own, .. } => BufferedOp::Set {
                value,
                expire: expire.unwrap_or(own),
            },
            BufferedOp::Add { expire: own, .. } => BufferedOp::Add {
                value,
                expire: expire.unwrap_or(own),
            },
            BufferedOp::Replace { expire: own, .. } => BufferedOp::Replace {
                value,
                expire: expire.unwrap_or(own),
            },
            BufferedOp::Cas {
                token, expire: own, ..
            } => BufferedOp::Cas {
                token,
                value,
                expire: expire.or(own),
            },
            // a delete already made the key absent
            BufferedOp::Delete | BufferedOp::Touch { .. } => BufferedOp::Set {
                value,
                expire: expire.unwrap_or(Expiry::NEVER),
            },
        }
    }

    fn with_expire(self, expire: Expiry) -> BufferedOp {
        match self {
            BufferedOp::Set { value, .. } => BufferedOp::Set { value, expire },
            BufferedOp::Add { value, .. } => BufferedOp::Add { value, expire },
            BufferedOp::Replace { value, .. } => BufferedOp::Replace { value, expire },
            BufferedOp::Cas { token, value, .. } => BufferedOp::Cas {
                token,
                value,
                expire: Some(expire),
            },
            BufferedOp::Delete => BufferedOp::Delete,
            BufferedOp::Touch { .. } => BufferedOp::Touch { expire },
        }
    }
}

/// Which part of the target a batch clears before its ops land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushScope {
    /// Every entry of the target.
    All,
    /// Entries whose key starts with the prefix.
    Prefix(String),
}

impl FlushScope {
    /// Whether `key` is cleared by this flush.
    pub fn covers(&self, key: &str) -> bool {
        match self {
            FlushScope::All => true,
            FlushScope::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

/// Everything a buffer wants applied, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// Clear this part of the target before applying `ops`.
    pub flush: Option<FlushScope>,
    /// Pending writes in first-touch order.
    pub ops: Vec<(String, BufferedOp)>,
}

impl Batch {
    /// Whether there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.flush.is_none() && self.ops.is_empty()
    }

    /// Whether the batch's flush clears `key`, so guards must treat it as absent.
    pub fn clears(&self, key: &str) -> bool {
        self.flush.as_ref().is_some_and(|scope| scope.covers(key))
    }
}

/// A write that did not make it into the target store.
#[derive(Debug, Clone)]
pub struct CommitFailure {
    pub key: String,
    pub error: CacheError,
}

/// Outcome of a commit.
#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    /// Number of ops written.
    pub applied: usize,
    /// Ops that were rejected or failed.
    pub failed: Vec<CommitFailure>,
}

impl CommitReport {
    /// Whether every op was applied.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Keys of the failed ops.
    pub fn failed_keys(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.key.as_str()).collect()
    }
}

/// Apply one buffered op to a store. `Ok(false)` means its guard did not hold.
pub async fn apply_op(store: &dyn Store, key: &str, op: &BufferedOp) -> Result<bool, CacheError> {
    match op {
        BufferedOp::Set { value, expire } => store.set(key, value.clone(), *expire).await,
        BufferedOp::Add { value, expire } => store.add(key, value.clone(), *expire).await,
        BufferedOp::Replace { value, expire } => store.replace(key, value.clone(), *expire).await,
        BufferedOp::Cas {
            token,
            value,
            expire: Some(expire),
        } => store.cas(token, key, value.clone(), *expire).await,
        BufferedOp::Cas {
            token,
            value,
            expire: None,
        } => store.cas_keep_ttl(token, key, value.clone()).await,
        BufferedOp::Delete => store.delete(key).await.map(|_| true),
        BufferedOp::Touch { expire } => store.touch(key, *expire).await,
    }
}

async fn apply_flush(store: &dyn Store, scope: &FlushScope) -> Result<(), CacheError> {
    let flushed = match scope {
        FlushScope::All => store.flush().await?,
        FlushScope::Prefix(prefix) => match store.prefix_flush() {
            Some(enumerate) => enumerate.flush_prefix(prefix).await?,
            None => {
                return Err(CacheError::operation(
                    store.name(),
                    "unsupported",
                    format!("cannot flush prefix '{}' before commit", prefix),
                ));
            }
        },
    };
    if !flushed {
        return Err(CacheError::operation(
            store.name(),
            "flush",
            "flush rejected before commit",
        ));
    }
    Ok(())
}

/// Apply a batch to a store.
///
/// Stores with [`crate::store::AtomicBatch`] get the whole batch in one call
/// and either take all of it or none. Other stores get the ops one at a
/// time; failures are reported and successes are kept.
pub async fn commit_batch(store: &dyn Store, batch: &Batch) -> Result<CommitReport, CacheError> {
    let mut report = CommitReport::default();
    if batch.is_empty() {
        return Ok(report);
    }

    if let Some(atomic) = store.atomic_batch() {
        let rejected = atomic.apply_batch(batch).await?;
        if rejected.is_empty() {
            report.applied = batch.ops.len();
        } else {
            tracing::warn!(
                "Atomic commit rejected: store={}, conflicts={}",
                store.name(),
                rejected.join(",")
            );
            report.failed = rejected
                .into_iter()
                .map(|key| CommitFailure {
                    error: CacheError::CasConflict { key: key.clone() },
                    key,
                })
                .collect();
        }
        return Ok(report);
    }

    if let Some(scope) = &batch.flush {
        apply_flush(store, scope).await?;
    }

    for (key, op) in &batch.ops {
        match apply_op(store, key, op).await {
            Ok(true) => report.applied += 1,
            Ok(false) => {
                tracing::warn!(
                    "Buffered write rejected: store={}, op={}, key={}",
                    store.name(),
                    op.kind(),
                    key
                );
                report.failed.push(CommitFailure {
                    key: key.clone(),
                    error: CacheError::CasConflict { key: key.clone() },
                });
            }
            Err(e) => {
                tracing::warn!(
                    "Buffered write failed: store={}, op={}, key={}, error={}",
                    store.name(),
                    op.kind(),
                    key,
                    e
                );
                report.failed.push(CommitFailure {
                    key: key.clone(),
                    error: e,
                });
            }
        }
    }

    Ok(report)
}

/// Pending writes plus what the buffer knows about each key it touched.
///
/// Every flush, commit or rollback starts a new generation. Callers that
/// read the wrapped store without holding the buffer pass the generation
/// they started in, so what they learned is not mixed into a newer one.
#[derive(Debug, Default)]
pub struct Buffer {
    pending: IndexMap<String, BufferedOp>,
    /// `None` means the key is known to be absent.
    known: HashMap<String, Option<Item>>,
    /// A flush is pending, so every key not in `known` is absent.
    flushed: bool,
    next_token: u64,
    generation: u64,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Buffer::default()
    }

    /// The current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// What the buffer knows about `key`.
    ///
    /// `None` means the key must be read from the wrapped store first.
    pub fn lookup(&self, key: &str) -> Option<Option<&Item>> {
        match self.known.get(key) {
            Some(item) => Some(item.as_ref()),
            None if self.flushed => Some(None),
            None => None,
        }
    }

    /// Remember a value read from the wrapped store during `generation`
    /// and return what readers should see.
    ///
    /// If the buffer learned about the key in the meantime, its own view
    /// wins. A read from an older generation is returned but not kept.
    pub fn record_read(&mut self, generation: u64, key: &str, item: Option<Item>) -> Option<Item> {
        if generation != self.generation {
            return item;
        }
        if let Some(known) = self.lookup(key) {
            return known.cloned();
        }
        self.known.insert(key.to_string(), item.clone());
        item
    }

    /// Record a write. `view` is the value readers observe afterwards;
    /// `None` with a [`BufferedOp::Touch`] leaves the value unchanged.
    pub fn write(&mut self, key: &str, op: BufferedOp, view: Option<Vec<u8>>) {
        match &op {
            BufferedOp::Delete => {
                self.known.insert(key.to_string(), None);
            }
            BufferedOp::Touch { .. } => {}
            _ => {
                let token = self.mint_token();
                let value = view.unwrap_or_default();
                self.known
                    .insert(key.to_string(), Some(Item::new(value, token)));
            }
        }

        if let Some(slot) = self.pending.get_mut(key) {
            let prev = std::mem::replace(slot, BufferedOp::Delete);
            *slot = prev.merge(op);
        } else {
            self.pending.insert(key.to_string(), op);
        }
    }

    /// Forget every pending op and hide everything in the wrapped store.
    pub fn flush(&mut self) {
        self.pending.clear();
        self.known.clear();
        self.flushed = true;
        self.generation += 1;
    }

    /// The pending op for a key.
    pub fn pending(&self, key: &str) -> Option<&BufferedOp> {
        self.pending.get(key)
    }

    /// Number of keys with a pending op.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Take everything pending and reset the buffer.
    pub fn take_batch(&mut self) -> Batch {
        let batch = Batch {
            flush: self.flushed.then_some(FlushScope::All),
            ops: self.pending.drain(..).collect(),
        };
        self.clear();
        batch
    }

    /// Drop everything without applying it.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.known.clear();
        self.flushed = false;
        self.generation += 1;
    }

    fn mint_token(&mut self) -> CasToken {
        self.next_token += 1;
        CasToken::new(format!("buffer:{}", self.next_token))
    }
}
