//! Per-layer hit/miss tracking and periodic sampling.
//!
//! Rates are exponentially weighted moving averages updated on every access,
//! so they follow recent traffic rather than the lifetime totals. The raw
//! counters are kept alongside for reporting.

use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Weight of the newest sample in the moving averages.
pub const DEFAULT_EWMA_ALPHA: f64 = 0.1;

/// The three cache tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    L1,
    L2,
    L3,
}

impl Layer {
    fn index(self) -> usize {
        match self {
            Layer::L1 => 0,
            Layer::L2 => 1,
            Layer::L3 => 2,
        }
    }
}

/// Reported numbers for one layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LayerStats {
    /// EWMA of the hit ratio, in `[0, 1]`.
    pub hit_rate: f64,
    /// EWMA of the miss ratio, in `[0, 1]`.
    pub miss_rate: f64,
    /// Bytes held (estimated for L1, reported by the backend for L2, zero for L3).
    pub memory_usage: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_failures: u64,
}

/// Snapshot across all layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub l1: LayerStats,
    pub l2: LayerStats,
    pub l3: LayerStats,
    /// Unix milliseconds when the snapshot was taken.
    pub sampled_at: i64,
}

/// Collects hit/miss/write outcomes for every layer.
#[derive(Debug)]
pub struct StatsCollector {
    alpha: f64,
    layers: Mutex<[LayerStats; 3]>,
}

impl StatsCollector {
    pub fn new(alpha: f64) -> Self {
        StatsCollector {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            layers: Mutex::new([LayerStats::default(); 3]),
        }
    }

    pub fn record_hit(&self, layer: Layer) {
        self.record_read(layer, true);
    }

    pub fn record_miss(&self, layer: Layer) {
        self.record_read(layer, false);
    }

    pub fn record_write(&self, layer: Layer, ok: bool) {
        let mut layers = self.layers.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = &mut layers[layer.index()];
        stats.writes += 1;
        if !ok {
            stats.write_failures += 1;
        }
    }

    /// Counters and rates for `layer`; `memory_usage` is left at zero for the caller to fill.
    pub fn snapshot(&self, layer: Layer) -> LayerStats {
        let layers = self.layers.lock().unwrap_or_else(PoisonError::into_inner);
        layers[layer.index()]
    }

    fn record_read(&self, layer: Layer, hit: bool) {
        let sample = if hit { 1.0 } else { 0.0 };
        let mut layers = self.layers.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = &mut layers[layer.index()];

        if stats.hits + stats.misses == 0 {
            // The first sample seeds the average.
            stats.hit_rate = sample;
        } else {
            stats.hit_rate += self.alpha * (sample - stats.hit_rate);
        }
        stats.miss_rate = 1.0 - stats.hit_rate;

        if hit {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        StatsCollector::new(DEFAULT_EWMA_ALPHA)
    }
}

/// Background task publishing a [`CacheStats`] snapshot on a fixed interval.
pub struct StatsSampler {
    handle: JoinHandle<()>,
    latest: watch::Receiver<Option<CacheStats>>,
}

impl StatsSampler {
    /// Start sampling. `sample` is called once per tick.
    pub fn spawn<F, Fut>(interval: Duration, sample: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = CacheStats> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let stats = sample().await;
                tracing::debug!(
                    l1_hit_rate = stats.l1.hit_rate,
                    l2_hit_rate = stats.l2.hit_rate,
                    l1_memory = stats.l1.memory_usage,
                    l2_memory = stats.l2.memory_usage,
                    l3_write_failures = stats.l3.write_failures,
                    "cache stats sampled"
                );
                if tx.send(Some(stats)).is_err() {
                    // Every receiver is gone, including ours.
                    break;
                }
            }
        });

        StatsSampler { handle, latest: rx }
    }

    /// A receiver that observes every new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Option<CacheStats>> {
        self.latest.clone()
    }

    /// Most recent snapshot, if one has been taken.
    pub fn latest(&self) -> Option<CacheStats> {
        *self.latest.borrow()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_rate() {
        let stats = StatsCollector::default();
        stats.record_hit(Layer::L1);

        let l1 = stats.snapshot(Layer::L1);
        assert_eq!(l1.hit_rate, 1.0);
        assert_eq!(l1.miss_rate, 0.0);
        assert_eq!(l1.hits, 1);
    }

    #[test]
    fn test_ewma_moves_toward_recent_traffic() {
        let stats = StatsCollector::new(0.5);
        stats.record_hit(Layer::L2);
        stats.record_miss(Layer::L2);
        assert!((stats.snapshot(Layer::L2).hit_rate - 0.5).abs() < 1e-9);

        stats.record_miss(Layer::L2);
        let l2 = stats.snapshot(Layer::L2);
        assert!((l2.hit_rate - 0.25).abs() < 1e-9);
        assert!((l2.miss_rate - 0.75).abs() < 1e-9);
        assert_eq!(l2.misses, 2);
    }

    #[test]
    fn test_layers_are_independent() {
        let stats = StatsCollector::default();
        stats.record_miss(Layer::L1);
        stats.record_write(Layer::L3, false);

        assert_eq!(stats.snapshot(Layer::L2), LayerStats::default());
        let l3 = stats.snapshot(Layer::L3);
        assert_eq!(l3.writes, 1);
        assert_eq!(l3.write_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_publishes_snapshots() {
        let sampler = StatsSampler::spawn(Duration::from_secs(1), || async {
            CacheStats {
                sampled_at: 7,
                ..CacheStats::default()
            }
        });
        let mut rx = sampler.subscribe();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().map(|s| s.sampled_at), Some(7));
        assert_eq!(sampler.latest().map(|s| s.sampled_at), Some(7));
        sampler.stop();
    }
}
