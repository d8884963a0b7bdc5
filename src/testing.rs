//! Test helpers.

use async_trait::async_trait;
use std::sync::Arc;

use crate::entry::{CasToken, Expiry, Item};
use crate::error::CacheError;
use crate::store::Store;
use crate::stores::memory::{MemoryStore, MemoryStoreConfig};

/// A memory store that hides its optional capabilities, standing in for
/// backends without prefix enumeration or multi-key transactions.
pub struct PlainStore {
    pub memory: Arc<MemoryStore>,
}

impl PlainStore {
    pub fn new() -> Self {
        Self::over(Arc::new(MemoryStore::new(MemoryStoreConfig::default())))
    }

    pub fn over(memory: Arc<MemoryStore>) -> Self {
        PlainStore { memory }
    }
}

#[async_trait]
impl Store for PlainStore {
    fn name(&self) -> &'static str {
        "plain"
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, CacheError> {
        self.memory.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.memory.set(key, value, expire).await
    }

    async fn add(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.memory.add(key, value, expire).await
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.memory.replace(key, value, expire).await
    }

    async fn cas(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.memory.cas(token, key, value, expire).await
    }

    async fn cas_keep_ttl(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        self.memory.cas_keep_ttl(token, key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.memory.delete(key).await
    }

    async fn increment(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        self.memory.increment(key, offset, initial, expire).await
    }

    async fn decrement(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        self.memory.decrement(key, offset, initial, expire).await
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool, CacheError> {
        self.memory.touch(key, expire).await
    }

    async fn flush(&self) -> Result<bool, CacheError> {
        self.memory.flush().await
    }
}

/// A store whose every operation fails like an unreachable backend.
pub struct FailingStore;

impl FailingStore {
    fn down<T>() -> Result<T, CacheError> {
        Err(CacheError::operation("failing", "unreachable", "connection refused"))
    }
}

#[async_trait]
impl Store for FailingStore {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, _key: &str) -> Result<Option<Item>, CacheError> {
        Self::down()
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _expire: Expiry) -> Result<bool, CacheError> {
        Self::down()
    }

    async fn add(&self, _key: &str, _value: Vec<u8>, _expire: Expiry) -> Result<bool, CacheError> {
        Self::down()
    }

    async fn replace(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _expire: Expiry,
    ) -> Result<bool, CacheError> {
        Self::down()
    }

    async fn cas(
        &self,
        _token: &CasToken,
        _key: &str,
        _value: Vec<u8>,
        _expire: Expiry,
    ) -> Result<bool, CacheError> {
        Self::down()
    }

    async fn cas_keep_ttl(
        &self,
        _token: &CasToken,
        _key: &str,
        _value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        Self::down()
    }

    async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        Self::down()
    }

    async fn increment(
        &self,
        _key: &str,
        _offset: u64,
        _initial: u64,
        _expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        Self::down()
    }

    async fn decrement(
        &self,
        _key: &str,
        _offset: u64,
        _initial: u64,
        _expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        Self::down()
    }

    async fn touch(&self, _key: &str, _expire: Expiry) -> Result<bool, CacheError> {
        Self::down()
    }

    async fn flush(&self) -> Result<bool, CacheError> {
        Self::down()
    }
}
