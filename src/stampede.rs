//! Stampede protection.
//!
//! When many callers miss the same key at once, only one of them (the
//! leader) should recompute the value. The leader is whoever wins an `add`
//! of a short-lived lock key next to the cached key. Everyone else
//! (followers) polls for the value with exponential backoff, serves a stale
//! copy when one is kept, and after `max_wait` either takes over the lock
//! or gives up waiting and computes on their own.
//!
//! The lock lives in the wrapped store, so the protection holds across
//! processes sharing a backend. A crashed leader's lock expires after
//! `lock_ttl_secs`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::entry::{CasToken, Expiry, Item};
use crate::error::CacheError;
use crate::store::{PrefixFlush, Store};
use crate::utils::validate_derived_key;

/// Tuning for [`StampedeProtector`].
#[derive(Debug, Clone)]
pub struct StampedeConfig {
    /// Lifetime of a lock key. Bounds how long a crashed leader blocks others.
    pub lock_ttl_secs: u64,
    /// Longest a follower waits before acting on its own.
    pub max_wait: Duration,
    /// First poll interval of a waiting follower.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling poll interval.
    pub max_backoff: Duration,
    /// Keep a stale copy of every value written through the protector for
    /// this many seconds, and serve it to followers instead of waiting.
    pub stale_ttl_secs: Option<u64>,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        StampedeConfig {
            lock_ttl_secs: 10,
            max_wait: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(250),
            stale_ttl_secs: None,
        }
    }
}

/// What a caller that missed should do next.
enum Claim {
    /// The caller holds the lock and must produce the value.
    Leader,
    /// A value (fresh or stale) became available.
    Value(Item),
    /// Waiting timed out and the lock is still taken elsewhere.
    Independent,
}

/// Coordinates recomputation of missing keys.
///
/// Usable two ways:
/// - [`StampedeProtector::get_or_compute`] runs the whole protocol around a
///   closure producing the value.
/// - As a [`Store`]: a `get` miss makes the caller leader and returns the
///   miss; the caller's next write of that key through the protector
///   releases the lock. Followers block inside `get` until the value shows
///   up or their wait runs out.
pub struct StampedeProtector {
    inner: Arc<dyn Store>,
    config: StampedeConfig,
    /// Keys whose lock this handle took in transparent mode, with the time
    /// the lock key expires in the wrapped store.
    held: Mutex<HashMap<String, Instant>>,
}

impl StampedeProtector {
    /// Protect `inner` with the given tuning.
    pub fn new(inner: Arc<dyn Store>, config: StampedeConfig) -> Self {
        StampedeProtector {
            inner,
            config,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// The tuning in use.
    pub fn config(&self) -> &StampedeConfig {
        &self.config
    }

    /// Key under which the lock for `key` is stored.
    pub fn lock_key(key: &str) -> String {
        format!("{}.lock", key)
    }

    /// Key under which the stale copy of `key` is stored.
    pub fn stale_key(key: &str) -> String {
        format!("{}.stale", key)
    }

    /// Whether this handle holds the transparent-mode lock for `key`.
    ///
    /// A lock is only held until its key expires in the wrapped store.
    pub fn holds_lock(&self, key: &str) -> bool {
        let mut held = self.held.lock();
        match held.get(key) {
            Some(deadline) if *deadline > Instant::now() => true,
            Some(_) => {
                held.remove(key);
                false
            }
            None => false,
        }
    }

    /// Reject keys whose lock or stale key would not be a valid key.
    fn check_key(&self, key: &str) -> Result<(), CacheError> {
        let suffix = if self.config.stale_ttl_secs.is_some() {
            ".stale".len()
        } else {
            ".lock".len()
        };
        validate_derived_key(
            key,
            suffix,
            "key is longer than 250 bytes once the stampede suffix is added",
        )
    }

    /// Return the cached value of `key`, computing and storing it on a miss.
    ///
    /// Among concurrent callers missing the same key, normally only one runs
    /// `compute`. The others wait for its result. A caller that waited
    /// `max_wait` while the lock stayed taken computes the value itself.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        expire: Expiry,
        compute: F,
    ) -> Result<Vec<u8>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, CacheError>>,
    {
        self.check_key(key)?;
        if let Some(item) = self.inner.get(key).await? {
            return Ok(item.value);
        }

        match self.claim(key).await? {
            Claim::Value(item) => Ok(item.value),
            Claim::Leader => {
                tracing::debug!("Computing value as stampede leader: key={}", key);
                let computed = compute().await;
                let stored = match &computed {
                    Ok(value) => self.store_value(key, value.clone(), expire).await,
                    Err(_) => Ok(()),
                };
                self.unlock(key).await;
                stored?;
                computed
            }
            Claim::Independent => {
                let value = compute().await?;
                self.store_value(key, value.clone(), expire).await?;
                Ok(value)
            }
        }
    }

    /// Take the lock for `key`. `Ok(false)` if someone else holds it.
    async fn acquire(&self, key: &str) -> Result<bool, CacheError> {
        self.inner
            .add(
                &Self::lock_key(key),
                b"1".to_vec(),
                Expiry::after_secs(self.config.lock_ttl_secs),
            )
            .await
    }

    async fn unlock(&self, key: &str) {
        if let Err(e) = self.inner.delete(&Self::lock_key(key)).await {
            // The lock still expires on its own
            tracing::warn!("Failed to release stampede lock: key={}, error={}", key, e);
        }
    }

    async fn stale(&self, key: &str) -> Result<Option<Item>, CacheError> {
        if self.config.stale_ttl_secs.is_none() {
            return Ok(None);
        }
        self.inner.get(&Self::stale_key(key)).await
    }

    /// Decide the role of a caller that just missed `key`.
    async fn claim(&self, key: &str) -> Result<Claim, CacheError> {
        if self.acquire(key).await? {
            return self.lead(key).await;
        }

        if let Some(item) = self.stale(key).await? {
            tracing::debug!("Serving stale value while another caller recomputes: key={}", key);
            return Ok(Claim::Value(item));
        }

        if let Some(item) = self.wait_for(key).await? {
            return Ok(Claim::Value(item));
        }

        if self.acquire(key).await? {
            return self.lead(key).await;
        }

        tracing::warn!(
            "Stampede lock still taken after waiting, computing independently: key={}, max_wait_ms={}",
            key,
            self.config.max_wait.as_millis()
        );
        Ok(Claim::Independent)
    }

    /// Having just taken the lock, check whether the value landed in the
    /// meantime.
    async fn lead(&self, key: &str) -> Result<Claim, CacheError> {
        if let Some(item) = self.inner.get(key).await? {
            self.unlock(key).await;
            return Ok(Claim::Value(item));
        }
        Ok(Claim::Leader)
    }

    /// Poll for `key` until it appears, the lock disappears, or `max_wait`
    /// passes.
    async fn wait_for(&self, key: &str) -> Result<Option<Item>, CacheError> {
        let deadline = Instant::now() + self.config.max_wait;
        let lock = Self::lock_key(key);
        let mut backoff = self.config.initial_backoff;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;

            if let Some(item) = self.inner.get(key).await? {
                return Ok(Some(item));
            }
            if self.inner.get(&lock).await?.is_none() {
                tracing::debug!("Stampede lock released without a value: key={}", key);
                return Ok(None);
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Write a computed value and its stale copy.
    async fn store_value(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<(), CacheError> {
        if let Some(stale_ttl) = self.config.stale_ttl_secs {
            self.inner
                .set(&Self::stale_key(key), value.clone(), Expiry::after_secs(stale_ttl))
                .await?;
        }
        self.inner.set(key, value, expire).await?;
        Ok(())
    }

    async fn refresh_stale(&self, key: &str) {
        let Some(stale_ttl) = self.config.stale_ttl_secs else {
            return;
        };
        let copied = match self.inner.get(key).await {
            Ok(Some(item)) => {
                self.inner
                    .set(&Self::stale_key(key), item.value, Expiry::after_secs(stale_ttl))
                    .await
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };
        if let Err(e) = copied {
            tracing::warn!("Failed to keep stale copy: key={}, error={}", key, e);
        }
    }

    /// Release the lock taken by an earlier transparent `get` miss.
    ///
    /// An expired lock is only forgotten: its key may belong to another
    /// leader by now.
    async fn release(&self, key: &str) {
        let deadline = self.held.lock().remove(key);
        match deadline {
            Some(deadline) if deadline > Instant::now() => self.unlock(key).await,
            Some(_) => tracing::debug!("Stampede lock expired before release: key={}", key),
            None => {}
        }
    }

    /// Remember a transparent-mode lock, forgetting the ones that expired.
    fn hold(&self, key: &str) {
        let now = Instant::now();
        let mut held = self.held.lock();
        held.retain(|_, deadline| *deadline > now);
        held.insert(
            key.to_string(),
            now + Duration::from_secs(self.config.lock_ttl_secs),
        );
    }

    /// Transparent-mode handling of a miss.
    async fn on_miss(&self, key: &str) -> Result<Option<Item>, CacheError> {
        if self.holds_lock(key) {
            return Ok(None);
        }
        match self.claim(key).await? {
            Claim::Value(item) => Ok(Some(item)),
            Claim::Leader => {
                self.hold(key);
                Ok(None)
            }
            Claim::Independent => Ok(None),
        }
    }

    /// Finish a write of `key`: refresh the stale copy and drop the lock.
    async fn after_write(&self, key: &str, written: bool) {
        if written {
            self.refresh_stale(key).await;
        }
        self.release(key).await;
    }
}

#[async_trait]
impl Store for StampedeProtector {
    fn name(&self) -> &'static str {
        "stampede"
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, CacheError> {
        self.check_key(key)?;
        match self.inner.get(key).await? {
            Some(item) => Ok(Some(item)),
            None => self.on_miss(key).await,
        }
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Item>, CacheError> {
        keys.iter().try_for_each(|key| self.check_key(key))?;
        let mut items = self.inner.get_multi(keys).await?;
        for key in keys {
            if items.contains_key(*key) {
                continue;
            }
            if let Some(item) = self.on_miss(key).await? {
                items.insert(key.to_string(), item);
            }
        }
        Ok(items)
    }

    async fn set(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.check_key(key)?;
        let result = self.inner.set(key, value, expire).await;
        self.after_write(key, matches!(result, Ok(true))).await;
        result
    }

    async fn add(&self, key: &str, value: Vec<u8>, expire: Expiry) -> Result<bool, CacheError> {
        self.check_key(key)?;
        let result = self.inner.add(key, value, expire).await;
        self.after_write(key, matches!(result, Ok(true))).await;
        result
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.check_key(key)?;
        let result = self.inner.replace(key, value, expire).await;
        self.after_write(key, matches!(result, Ok(true))).await;
        result
    }

    async fn cas(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
        expire: Expiry,
    ) -> Result<bool, CacheError> {
        self.check_key(key)?;
        let result = self.inner.cas(token, key, value, expire).await;
        self.after_write(key, matches!(result, Ok(true))).await;
        result
    }

    async fn cas_keep_ttl(
        &self,
        token: &CasToken,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        self.check_key(key)?;
        let result = self.inner.cas_keep_ttl(token, key, value).await;
        self.after_write(key, matches!(result, Ok(true))).await;
        result
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check_key(key)?;
        let result = self.inner.delete(key).await;
        if self.config.stale_ttl_secs.is_some()
            && let Err(e) = self.inner.delete(&Self::stale_key(key)).await
        {
            tracing::warn!("Failed to drop stale copy: key={}, error={}", key, e);
        }
        self.release(key).await;
        result
    }

    async fn increment(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        self.check_key(key)?;
        let result = self.inner.increment(key, offset, initial, expire).await;
        self.after_write(key, matches!(result, Ok(Some(_)))).await;
        result
    }

    async fn decrement(
        &self,
        key: &str,
        offset: u64,
        initial: u64,
        expire: Expiry,
    ) -> Result<Option<u64>, CacheError> {
        self.check_key(key)?;
        let result = self.inner.decrement(key, offset, initial, expire).await;
        self.after_write(key, matches!(result, Ok(Some(_)))).await;
        result
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool, CacheError> {
        self.check_key(key)?;
        self.inner.touch(key, expire).await
    }

    async fn flush(&self) -> Result<bool, CacheError> {
        self.held.lock().clear();
        self.inner.flush().await
    }

    fn prefix_flush(&self) -> Option<&dyn PrefixFlush> {
        self.inner.prefix_flush()
    }
}
