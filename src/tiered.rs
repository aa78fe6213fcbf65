use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, watch};

use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, VersionSource};
use crate::error::CacheError;
use crate::invalidation::Invalidator;
use crate::layer::{EdgeLayer, RemoteLayer};
use crate::pattern::{KeyPattern, is_pattern};
use crate::stats::{CacheStats, Layer, LayerStats, StatsCollector, StatsSampler};
use crate::store::{EdgeStore, RemoteStore};
use crate::stores::moka::MokaStore;
use crate::utils::{Clock, duration_ms};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WarmupLoader<V> = Box<dyn FnOnce() -> BoxFuture<'static, Result<Option<V>, BoxError>> + Send>;

/// A key to prime together with the loader that produces its value.
pub struct WarmupEntry<V> {
    key: String,
    loader: WarmupLoader<V>,
}

impl<V> WarmupEntry<V>
where
    V: Send + 'static,
{
    pub fn new<F, Fut, E>(key: impl Into<String>, loader: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        WarmupEntry {
            key: key.into(),
            loader: Box::new(move || Box::pin(async move { loader().await.map_err(Into::into) })),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Outcome counts of a warmup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// Loader returned a value and it was written.
    pub loaded: usize,
    /// Loader returned nothing.
    pub empty: usize,
    /// Loader failed; the entry was skipped.
    pub failed: usize,
}

/// Per-layer probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub l1: bool,
    pub l2: bool,
    pub l3: bool,
}

/// Holds a per-key load lock and drops its map slot when nobody else is waiting.
struct InFlight<'a> {
    map: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    key: String,
    guard: OwnedMutexGuard<()>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = OwnedMutexGuard::mutex(&self.guard);
        // One reference in the map, one in our guard: no waiters left.
        if map.get(&self.key).is_some_and(|held| Arc::ptr_eq(held, lock))
            && Arc::strong_count(lock) <= 2
        {
            map.remove(&self.key);
        }
    }
}

struct Inner<V>
where
    V: Clone + Send + Sync + 'static,
{
    l1: MokaStore<V>,
    l2: RemoteLayer,
    l3: EdgeLayer,
    stats: Arc<StatsCollector>,
    clock: Arc<dyn Clock>,
    versions: VersionSource,
    config: CacheConfig,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    sampler: Mutex<Option<StatsSampler>>,
}

/// The cache coordinator: one facade over L1, L2 and L3.
///
/// Reads go L1 → L2 → loader, backfilling the faster layers on the way out.
/// Writes land in L1 and L2 before returning; the L3 write is fire-and-forget.
/// L2 and L3 failures are logged and absorbed, never returned.
///
/// `TieredCache` is cheap to clone; clones share the same layers.
pub struct TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        TieredCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Assemble a coordinator from already-connected layers.
    ///
    /// Most callers go through [`TieredCacheBuilder`](crate::TieredCacheBuilder),
    /// which connects L2 from configuration.
    pub fn new(
        config: CacheConfig,
        l2: Option<Arc<dyn RemoteStore>>,
        l3: Arc<dyn EdgeStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stats = Arc::new(StatsCollector::default());
        let codec = Codec::new(config.l2.format);

        let inner = Inner {
            l1: MokaStore::new(&config.l1, clock.clone()),
            l2: RemoteLayer::new(
                l2,
                codec,
                config.l2.key_prefix.clone(),
                config.l2.operation_timeout,
            ),
            l3: EdgeLayer::new(l3, codec, stats.clone()),
            stats,
            versions: VersionSource::seeded(clock.now_ms()),
            clock,
            config,
            in_flight: Mutex::new(HashMap::new()),
            sampler: Mutex::new(None),
        };

        tracing::info!(
            l1_max_items = inner.config.l1.max_items(),
            l2 = inner.l2.name(),
            format = ?inner.config.l2.format,
            "tiered cache initialized"
        );

        TieredCache {
            inner: Arc::new(inner),
        }
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Whether an L2 store is attached.
    pub fn l2_enabled(&self) -> bool {
        self.inner.l2.is_enabled()
    }

    /// Return the cached value.
    ///
    /// Returns `None` on a miss in every readable layer.
    pub async fn get(&self, key: &str) -> Option<V> {
        self.lookup(key).await
    }

    /// Read-through: return the cached value, or load, store and return it.
    ///
    /// The loader runs only when both L1 and L2 miss. Its error is returned unchanged.
    ///
    /// # Example
    /// ```ignore
    /// let user = cache.get_or_load("user:123", || async {
    ///     db.get_user("123").await
    /// }).await?;
    /// ```
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(value) = self.lookup(key).await {
            return Ok(Some(value));
        }

        let _in_flight = if self.inner.config.coalesce_loads {
            let guard = self.lock_key(key).await;
            // Someone may have loaded it while we waited.
            if let Some(entry) = self.inner.l1.get(key) {
                self.inner.stats.record_hit(Layer::L1);
                return Ok(Some(entry.value));
            }
            Some(guard)
        } else {
            None
        };

        let loaded = loader().await?;
        if let Some(ref value) = loaded {
            tracing::debug!(key, "loaded on miss, backfilling");
            self.write_through(key, value.clone(), None).await;
        }
        Ok(loaded)
    }

    /// Set the value in L1 and L2, and publish it to L3 in the background.
    ///
    /// `ttl` overrides every layer's default TTL.
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        validate_literal(key)?;
        self.write_through(key, value, ttl).await;
        Ok(())
    }

    /// Delete a key, or every key matching a `*` pattern, from L1 and L2.
    ///
    /// For patterns, returns whether anything matched. Literal deletes always return `true`.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey(key.to_string()));
        }

        if !is_pattern(key) {
            self.inner.l1.delete(key);
            self.inner.l2.delete(&[key.to_string()]).await;
            return Ok(true);
        }

        let pattern = KeyPattern::parse(key)?;
        let mut matched: BTreeSet<String> = self.inner.l1.delete_matching(&pattern).into_iter().collect();
        matched.extend(self.inner.l2.keys(&pattern).await);

        if !matched.is_empty() {
            let keys: Vec<String> = matched.iter().cloned().collect();
            self.inner.l2.delete(&keys).await;
        }

        tracing::debug!(pattern = key, matched = matched.len(), "pattern delete");
        Ok(!matched.is_empty())
    }

    /// Prime the cache from loaders, `warmup_batch_size` at a time.
    ///
    /// A failing loader is logged and skipped; it never aborts the run.
    pub async fn warmup(&self, entries: Vec<WarmupEntry<V>>) -> WarmupReport {
        let batch_size = self.inner.config.warmup_batch_size.max(1);
        let mut report = WarmupReport::default();
        let mut entries = entries.into_iter().peekable();

        while entries.peek().is_some() {
            let batch: Vec<_> = entries.by_ref().take(batch_size).collect();

            let results = join_all(batch.into_iter().map(|entry| async move {
                let WarmupEntry { key, loader } = entry;
                match loader().await {
                    Ok(Some(value)) => {
                        self.write_through(&key, value, None).await;
                        Ok(true)
                    }
                    Ok(None) => Ok(false),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "warmup loader failed, skipping");
                        Err(())
                    }
                }
            }))
            .await;

            for result in results {
                match result {
                    Ok(true) => report.loaded += 1,
                    Ok(false) => report.empty += 1,
                    Err(()) => report.failed += 1,
                }
            }
        }

        tracing::info!(
            loaded = report.loaded,
            empty = report.empty,
            failed = report.failed,
            "cache warmup finished"
        );
        report
    }

    /// Probe each layer independently.
    pub async fn health_check(&self) -> HealthStatus {
        let l1 = self.inner.l1.probe();
        let l2 = self.inner.l2.ping().await;
        let l3 = self.inner.l3.is_enabled();

        HealthStatus { l1, l2, l3 }
    }

    /// Current per-layer rates, counters and memory footprint.
    pub async fn stats(&self) -> CacheStats {
        let stats = &self.inner.stats;

        CacheStats {
            l1: LayerStats {
                memory_usage: self.inner.l1.memory_usage(),
                ..stats.snapshot(Layer::L1)
            },
            l2: LayerStats {
                memory_usage: self.inner.l2.memory_usage().await,
                ..stats.snapshot(Layer::L2)
            },
            l3: stats.snapshot(Layer::L3),
            sampled_at: self.inner.clock.now_ms(),
        }
    }

    /// Start sampling [`stats`](Self::stats) every `interval`.
    ///
    /// Replaces a sampler that is already running.
    pub fn start_sampler(&self, interval: Duration) -> watch::Receiver<Option<CacheStats>> {
        let cache = self.clone();
        let sampler = StatsSampler::spawn(interval, move || {
            let cache = cache.clone();
            async move { cache.stats().await }
        });
        let rx = sampler.subscribe();

        let mut slot = self.inner.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(sampler) {
            previous.stop();
        }
        rx
    }

    /// Drop every entry from every layer.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.inner.l1.clear();
        let l2_removed = self.inner.l2.clear().await;
        let l3_purged = self.inner.l3.purge_all().await;

        tracing::info!(l2_removed, l3_purged, "cache cleared");
        Ok(())
    }

    /// Keys visible in L1 or L2 that match `pattern`.
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let pattern = KeyPattern::parse(pattern)?;
        let mut keys: BTreeSet<String> = self
            .inner
            .l1
            .keys()
            .into_iter()
            .filter(|k| pattern.matches(k))
            .collect();
        keys.extend(self.inner.l2.keys(&pattern).await);
        Ok(keys.into_iter().collect())
    }

    /// Stop the sampler and release the L2 and L3 clients.
    ///
    /// The cache keeps serving from L1 afterwards.
    pub fn shutdown(&self) {
        let sampler = self
            .inner
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sampler) = sampler {
            sampler.stop();
        }
        self.inner.l2.close();
        self.inner.l3.close();
        tracing::info!("tiered cache shut down");
    }

    async fn lookup(&self, key: &str) -> Option<V> {
        let inner = &self.inner;

        if let Some(entry) = inner.l1.get(key) {
            inner.stats.record_hit(Layer::L1);
            return Some(entry.value);
        }
        inner.stats.record_miss(Layer::L1);

        if !inner.l2.is_enabled() {
            return None;
        }

        match inner.l2.get::<V>(key, inner.clock.now_ms()).await {
            Some(entry) => {
                inner.stats.record_hit(Layer::L2);
                // Backfill L1 with the same expiry and version as the L2 copy.
                let value = entry.value.clone();
                inner.l1.set(key, CacheEntry::new(entry.value, entry.expiry, entry.version));
                Some(value)
            }
            None => {
                inner.stats.record_miss(Layer::L2);
                None
            }
        }
    }

    async fn write_through(&self, key: &str, value: V, ttl: Option<Duration>) {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let version = inner.versions.next();

        let l1_ttl = ttl.unwrap_or(inner.config.l1.default_ttl);
        let l2_ttl = ttl.unwrap_or(inner.config.l2.default_ttl);
        let l3_ttl = ttl.unwrap_or(inner.config.l3.default_ttl);

        let l2_entry = CacheEntry::new(value.clone(), now.saturating_add(duration_ms(l2_ttl)), version);
        let l1_write = async {
            inner.l1.set(key, CacheEntry::new(value, now.saturating_add(duration_ms(l1_ttl)), version));
        };
        let l2_write = async {
            if inner.l2.is_enabled() {
                Some(inner.l2.set(key, &l2_entry, l2_ttl).await)
            } else {
                None
            }
        };

        let ((), l2_ok) = futures::join!(l1_write, l2_write);
        inner.stats.record_write(Layer::L1, true);
        if let Some(ok) = l2_ok {
            inner.stats.record_write(Layer::L2, ok);
        }

        if inner.l3.is_enabled() {
            let l3_entry = CacheEntry {
                expiry: now.saturating_add(duration_ms(l3_ttl)),
                ..l2_entry
            };
            inner.l3.dispatch_put(key, &l3_entry, l3_ttl);
        }
    }

    async fn lock_key(&self, key: &str) -> InFlight<'_> {
        let lock = {
            let mut map = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        InFlight {
            map: &self.inner.in_flight,
            key: key.to_string(),
            guard: lock.lock_owned().await,
        }
    }
}

fn validate_literal(key: &str) -> Result<(), CacheError> {
    if key.is_empty() || is_pattern(key) {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl<V> Invalidator for TieredCache<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    async fn invalidate(&self, pattern: &str) -> Result<bool, CacheError> {
        self.delete(pattern).await
    }

    async fn clear_all(&self) -> Result<(), CacheError> {
        self.clear().await
    }
}
