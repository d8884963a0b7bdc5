//! strata-kv - Layered key-value cache core for Rust
//!
//! This library provides one storage contract ([`Store`]) for byte payloads
//! with CAS tokens, counters and expiry, and a set of layers that compose on
//! top of any implementation of it:
//! - A memory store with exact LRU eviction under a byte budget
//! - A Redis store
//! - Namespaced collections with independent flush
//! - Buffered writes and nested transactions
//! - Stampede protection for expensive recomputation
//! - Sharding across several stores
//! - Metrics emission
//!
//! # Example
//!
//! ```ignore
//! use strata_kv::{Collection, Expiry, MemoryStore, MemoryStoreConfig, Store, TransactionalStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), strata_kv::CacheError> {
//!     let memory = Arc::new(MemoryStore::new(MemoryStoreConfig::default()));
//!
//!     // Namespaces share the memory budget but flush independently
//!     let users = Arc::new(Collection::new(memory.clone(), "users")?);
//!     let sessions = Collection::new(memory, "sessions")?;
//!
//!     users.set("user:123", b"Alice".to_vec(), Expiry::after_secs(300)).await?;
//!     sessions.flush().await?;
//!
//!     // Group writes and apply them together
//!     let tx = TransactionalStore::new(users);
//!     tx.begin().await;
//!     tx.increment("logins", 1, 0, Expiry::NEVER).await?;
//!     tx.set("user:124", b"Bob".to_vec(), Expiry::NEVER).await?;
//!     let report = tx.commit().await?;
//!     assert!(report.is_success());
//!     Ok(())
//! }
//! ```

mod buffer;
mod buffered;
mod codec;
mod collection;
mod entry;
mod error;
mod shard;
mod stampede;
mod store;
pub mod stores;
#[cfg(test)]
mod testing;
mod utils;

// Re-export public API
pub use buffer::{Batch, BufferedOp, CommitFailure, CommitReport, FlushScope};
pub use buffered::{BufferedStore, TransactionalStore};
pub use codec::{Codec, JsonCodec};
pub use collection::{Collection, PrefixStrategy};
pub use entry::{CasToken, Expiry, Item, RELATIVE_EXPIRY_THRESHOLD};
pub use error::CacheError;
pub use shard::{ShardStrategy, ShardedStore, shard_for};
pub use stampede::{StampedeConfig, StampedeProtector};
pub use store::{AtomicBatch, PrefixFlush, Store};
pub use stores::memory::{MemoryStore, MemoryStoreConfig};
pub use stores::metrics::{CacheMetric, MetricsSink, MetricsStore};
pub use stores::redis::{RedisStore, RedisStoreConfig};
pub use utils::{MAX_KEY_LEN, validate_key};
