use std::env;
use std::str::FromStr;

/// Benchmark knobs, read from the environment.
///
/// | Variable             | Default  |
/// |----------------------|----------|
/// | `REDIS_URL`          | unset, Redis group skipped |
/// | `ORIGIN_DELAY_MS`    | 20       |
/// | `BENCH_SAMPLE_SIZE`  | 100      |
/// | `BENCH_MEMORY_BYTES` | 1048576  |
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub redis_url: Option<String>,
    pub origin_delay_ms: u64,
    pub sample_size: usize,
    pub memory_bytes: u64,
}

fn env_or<T: FromStr>(name: &str, fallback: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            redis_url: env::var("REDIS_URL").ok(),
            origin_delay_ms: env_or("ORIGIN_DELAY_MS", 20),
            sample_size: env_or("BENCH_SAMPLE_SIZE", 100),
            memory_bytes: env_or("BENCH_MEMORY_BYTES", 1024 * 1024),
        }
    }
}

impl BenchConfig {
    /// Read the environment and print the effective settings.
    pub fn from_env() -> Self {
        let config = Self::default();
        eprintln!(
            "bench settings: redis={} origin_delay={}ms samples={} memory_budget={}B",
            config.redis_url.as_deref().unwrap_or("off"),
            config.origin_delay_ms,
            config.sample_size,
            config.memory_bytes
        );
        config
    }
}
