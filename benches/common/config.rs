use std::env;

/// Configuration for benchmarks, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Redis URL for the L2 runs (from REDIS_URL; unset skips them)
    pub redis_url: Option<String>,

    /// Simulated database latency in milliseconds (from DB_LATENCY_MS env var, defaults to 5)
    pub db_latency_ms: u64,

    /// Sample size for benchmarks (from BENCH_SAMPLE_SIZE env var, defaults to 50)
    pub sample_size: usize,

    /// Number of distinct keys (from BENCH_KEYS env var, defaults to 5000)
    pub num_keys: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            db_latency_ms: env_or("DB_LATENCY_MS", 5),
            sample_size: env_or("BENCH_SAMPLE_SIZE", 50),
            num_keys: env_or("BENCH_KEYS", 5_000),
        }
    }
}

impl BenchConfig {
    pub fn new() -> Self {
        let config = Self::default();
        eprintln!("Benchmark Configuration:");
        eprintln!("  Redis URL: {}", config.redis_url.as_deref().unwrap_or("(disabled)"));
        eprintln!("  DB Latency: {}ms", config.db_latency_ms);
        eprintln!("  Sample Size: {}", config.sample_size);
        eprintln!("  Keys: {}", config.num_keys);
        config
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
