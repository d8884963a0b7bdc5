//! Per-operation instrumentation for any store.
//!
//! [`MetricsStore`] sits in front of another store and reports every call to
//! a [`MetricsSink`]: one event per key read, per write attempt, per delete
//! batch and per flush, each tagged with the wrapped store's name.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_kv::{MemoryStore, MemoryStoreConfig, MetricsStore, Store};
//!
//! let memory = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
//! let store: Arc<dyn Store> = Arc::new(MetricsStore::new(memory, Arc::new(StatsdSink::new())));
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::entry::{CasToken, Expiry, Item};
use crate::error::CacheError;
use crate::store::{AtomicBatch, PrefixFlush, Store};

/// One observed store call.
///
/// `latency_ms` is wall time around the wrapped call. `tier` is the wrapped
/// store's [`Store::name`].
#[derive(Debug, Clone)]
pub enum CacheMetric {
    /// A key lookup. `get_multi` emits one per requested key.
    Read {
        key: String,
        /// The key held a live entry.
        hit: bool,
        latency_ms: f64,
        tier: String,
    },
    /// A write attempt: set, add, replace, cas, increment, decrement or touch.
    Write {
        key: String,
        op: &'static str,
        /// The store applied the write. False for rejected conditions and errors.
        success: bool,
        latency_ms: f64,
        tier: String,
    },
    /// A delete call, single or batched.
    Remove {
        requested: usize,
        /// Keys that held a live entry. Zero when the call failed.
        removed: usize,
        latency_ms: f64,
        tier: String,
    },
    /// A whole-store flush.
    Flush {
        success: bool,
        latency_ms: f64,
        tier: String,
    },
}

/// Destination for [`CacheMetric`] events.
///
/// `emit` runs inline on every store call, so sinks usually just enqueue
/// and ship events from `flush` or a background task.
///
/// ```ignore
/// struct ChannelSink(tokio::sync::mpsc::UnboundedSender<CacheMetric>);
///
/// #[async_trait]
/// impl MetricsSink for ChannelSink {
///     fn emit(&self, metric: CacheMetric) {
///         let _ = self.0.send(metric);
///     }
///
///     async fn flush(&self) -> Result<(), CacheError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Record one event. Must not block.
    fn emit(&self, metric: CacheMetric);

    /// Push out anything the sink is holding. Failures are the sink's own
    /// and are reported as `OperationFailed` with the sink as backend.
    async fn flush(&self) -> Result<(), CacheError>;
}

/// Reports every call on the wrapped store to a sink.
///
/// Optional capabilities of the wrapped store stay visible, but calls made
/// through them bypass instrumentation.
pub struct MetricsStore {
    inner: Arc<dyn Store>,
    sink: Arc<dyn MetricsSink>,
    tier_name: String,
}

impl MetricsStore {
    /// Instrument `inner`, tagging events with its name.
    pub fn new(inner: Arc<dyn Store>, sink: Arc<dyn MetricsSink>) -> Self {
        let tier_name = inner.name().to_string();
        MetricsStore {
            inner,
            sink,
            tier_name,
        }
    }

    /// The sink events go to.
    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }

    fn elapsed_ms(start: Instant) -> f64 {
        start.elapsed().as_secs_f64() * 1000.0
    }

    fn emit_write<T>(
        &self,
        key: &str,
        op: &'static str,
        start: Instant,
        result: &Result<T, CacheError>,
        accepted: impl Fn(&T) -> bool,
    ) {
        self.sink.emit(CacheMetric::Write {
            key: key.to_string(),
            op,
            success: result.as_ref().is_ok_and(accepted),
            latency_ms: Self::elapsed_ms(start),
            tier: self.tier_name.clone(),
        });
    }
}

#[async_trait]
impl Store for MetricsStore {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, CacheError> {
        let start = Instant::now();
        let result = self.inner.get(key).await;

        self.sink.emit(CacheMetric::Read {
            key: key.to_string(),
            hit: matches!(result, Ok(Some(_))),
            latency_ms: Self::elapsed_ms(start),
            tier: self.tier_name.clone(),
        });

        result
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Item>, CacheError> {
        let start = Instant::now();
        let result = self.inner.get_multi(keys).await;
        let latency_ms = Self::elapsed_ms(start);

        for key in keys {
            self.sink.emit(CacheMetric::Read {
                key: key.to_string(),
                hit: result.as_ref().is_ok_and(|items| items.contains_key(*key)),
                latency_ms,
                tier: self.tier_name.clone(),
            });
        }

        result
    }

    async fn set(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        let start = Instant::now();
        let result = self.inner.set(key, value, expire).await;
        self.emit_write(key, "set", start, &result, |ok| *ok);
        result
    }

    async fn set_multi(
        &self,
        items: Vec<(String, Vec<u8>)>,
        expire: Expiry,
    ) -> Result<HashMap<String, bool>, CacheError> {
        let keys: Vec<String> = items.iter().map(|(k, _)| k.clone()).collect();
        let start = Instant::now();
        let result = self.inner.set_multi(items, expire).await;
        for key in &keys {
            self.emit_write(key, "set", start, &result, |results| {
                results.get(key).copied().unwrap_or(false)
            });
        }
        result
    }

    async fn add(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        let start = Instant::now();
        let result = self.inner.add(key, value, expire).await;
        self.emit_write(key, "add", start, &result, |ok| *ok);
        result
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        let start = Instant::now();
        let result = self.inner.replace(key, value, expire).await;
        self.emit_write(key, "replace", start, &result, |ok| *ok);
        result
    }

    async fn cas(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        let start = Instant::now();
        let result = self.inner.cas(token, key, value, expire).await;
        self.emit_write(key, "cas", start, &result, |ok| *ok);
        result
    }

    async fn cas_keep_ttl(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        let start = Instant::now();
        let result = self.inner.cas_keep_ttl(token, key, value).await;
        self.emit_write(key, "cas", start, &result, |ok| *ok);
        result
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.delete_multi(&[key])
            .await
            .map(|results| results.get(key).copied().unwrap_or(false))
    }

    async fn delete_multi(&self, keys: &[&str]) -> Result<HashMap<String, bool>, CacheError> {
        let start = Instant::now();
        let result = self.inner.delete_multi(keys).await;

        let removed = result
            .as_ref()
            .map_or(0, |results| results.values().filter(|gone| **gone).count());
        self.sink.emit(CacheMetric::Remove {
            requested: keys.len(),
            removed,
            latency_ms: Self::elapsed_ms(start),
            tier: self.tier_name.clone(),
        });

        result
    }

    async fn increment(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        let start = Instant::now();
        let result = self.inner.increment(key, offset, initial, expire).await;
        self.emit_write(key, "increment", start, &result, Option::is_some);
        result
    }

    async fn decrement(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        let start = Instant::now();
        let result = self.inner.decrement(key, offset, initial, expire).await;
        self.emit_write(key, "decrement", start, &result, Option::is_some);
        result
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool, CacheError> {
        let start = Instant::now();
        let result = self.inner.touch(key, expire).await;
        self.emit_write(key, "touch", start, &result, |ok| *ok);
        result
    }

    async fn flush(&self) -> Result<bool, CacheError> {
        let start = Instant::now();
        let result = self.inner.flush().await;

        self.sink.emit(CacheMetric::Flush {
            success: matches!(result, Ok(true)),
            latency_ms: Self::elapsed_ms(start),
            tier: self.tier_name.clone(),
        });

        result
    }

    fn prefix_flush(&self) -> Option<&dyn PrefixFlush> {
        self.inner.prefix_flush()
    }

    fn atomic_batch(&self) -> Option<&dyn AtomicBatch> {
        self.inner.atomic_batch()
    }
}
