use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Test data structure for benchmarks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchOrder {
    pub id: u64,
    pub user_id: u64,
    pub symbol: String,
    pub quantity: u32,
}

impl BenchOrder {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            user_id: id % 100,
            symbol: ["BTC", "ETH", "SOL"][(id % 3) as usize].to_string(),
            quantity: (id % 1000) as u32,
        }
    }
}

/// Simulated order database with configurable latency
#[derive(Clone)]
pub struct FakeDatabase {
    data: Arc<HashMap<String, BenchOrder>>,
    latency: Duration,
    query_count: Arc<AtomicUsize>,
}

impl FakeDatabase {
    pub fn new(num_orders: usize, latency_ms: u64) -> Self {
        let data = (0..num_orders)
            .map(|i| (format!("order:{}", i), BenchOrder::new(i as u64)))
            .collect();

        Self {
            data: Arc::new(data),
            latency: Duration::from_millis(latency_ms),
            query_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Loader-shaped lookup.
    pub async fn load(&self, key: &str) -> Result<Option<BenchOrder>, Infallible> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        Ok(self.data.get(key).cloned())
    }

    #[allow(dead_code)]
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }
}

/// Generate keys for different workload patterns
pub struct KeyGenerator {
    num_keys: usize,
}

impl KeyGenerator {
    pub fn new(num_keys: usize) -> Self {
        Self {
            num_keys: num_keys.max(5),
        }
    }

    pub fn sequential(&self) -> Vec<String> {
        (0..self.num_keys).map(|i| format!("order:{}", i)).collect()
    }

    /// 80% of requests go to the first 20% of keys.
    pub fn skewed(&self, count: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let hot = self.num_keys / 5;

        (0..count)
            .map(|_| {
                let id = if rng.gen_bool(0.8) {
                    rng.gen_range(0..hot)
                } else {
                    rng.gen_range(hot..self.num_keys)
                };
                format!("order:{}", id)
            })
            .collect()
    }
}
