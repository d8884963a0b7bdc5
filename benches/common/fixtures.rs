use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strata_kv::{CacheError, Codec, JsonCodec};

/// Record served by the origin, roughly the size of a session blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: u64,
    pub owner: String,
    pub scopes: Vec<String>,
    pub issued_at: u64,
}

impl SessionRecord {
    pub fn for_index(index: u64) -> Self {
        SessionRecord {
            session_id: index,
            owner: format!("account-{:06}", index % 4096),
            scopes: vec!["read".into(), "write".into()],
            issued_at: 1_700_000_000 + index,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        JsonCodec.encode(self).unwrap_or_default()
    }
}

/// Key of the `index`th record.
pub fn session_key(index: usize) -> String {
    format!("session:{}", index)
}

/// Backing source with a fixed per-load delay that counts how often it is hit.
#[derive(Clone)]
pub struct SlowOrigin {
    records: Arc<HashMap<String, Vec<u8>>>,
    delay: Duration,
    loads: Arc<AtomicUsize>,
}

impl SlowOrigin {
    pub fn new(records: usize, delay_ms: u64) -> Self {
        let records = (0..records)
            .map(|i| (session_key(i), SessionRecord::for_index(i as u64).encode()))
            .collect();

        SlowOrigin {
            records: Arc::new(records),
            delay: Duration::from_millis(delay_ms),
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn load(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.records
            .get(key)
            .cloned()
            .ok_or_else(|| CacheError::operation("origin", "not_found", key.to_string()))
    }

    /// Every `(key, payload)` pair, for warming a store before a run.
    pub fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.records
            .iter()
            .map(|(key, payload)| (key.clone(), payload.clone()))
            .collect()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn reset_loads(&self) {
        self.loads.store(0, Ordering::Relaxed);
    }
}

/// Access patterns over a keyspace of `size` session keys.
pub struct Workload {
    size: usize,
    hot_fraction: f64,
}

impl Workload {
    /// `hot_fraction` of the keyspace receives 80% of the accesses.
    pub fn new(size: usize, hot_fraction: f64) -> Self {
        Workload {
            size: size.max(1),
            hot_fraction: hot_fraction.clamp(0.0, 1.0),
        }
    }

    pub fn all_keys(&self) -> Vec<String> {
        (0..self.size).map(session_key).collect()
    }

    pub fn skewed(&self, count: usize) -> Vec<String> {
        let hot = ((self.size as f64 * self.hot_fraction) as usize).clamp(1, self.size);
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| {
                let index = if hot == self.size || rng.gen_bool(0.8) {
                    rng.gen_range(0..hot)
                } else {
                    rng.gen_range(hot..self.size)
                };
                session_key(index)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_origin_counts_loads() {
        let origin = SlowOrigin::new(50, 0);

        let payload = origin.load("session:7").await.unwrap();
        let record: SessionRecord = JsonCodec.decode(&payload).unwrap();
        assert_eq!(record, SessionRecord::for_index(7));
        assert!(origin.load("session:50").await.is_err());
        assert_eq!(origin.loads(), 2);

        origin.reset_loads();
        assert_eq!(origin.loads(), 0);
        assert_eq!(origin.entries().len(), 50);
    }

    #[test]
    fn test_skewed_keys_stay_in_keyspace() {
        let workload = Workload::new(100, 0.2);
        assert_eq!(workload.all_keys()[3], "session:3");

        let keys = workload.skewed(500);
        assert_eq!(keys.len(), 500);
        assert!(keys.iter().all(|key| workload.all_keys().contains(key)));
    }
}
