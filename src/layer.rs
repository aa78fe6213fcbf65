//! Degrading facades over the L2 and L3 stores.
//!
//! The coordinator never sees an L2 or L3 error: these wrappers turn disabled
//! layers into no-ops and turn failures into misses, logging as they go.

use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::codec::Codec;
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::pattern::{KeyPattern, WILDCARD};
use crate::stats::{Layer, StatsCollector};
use crate::store::{EdgeStore, RemoteStore};
use crate::utils::{build_cache_key, strip_cache_key};

/// The optional shared layer.
pub struct RemoteLayer {
    backend: RwLock<Option<Arc<dyn RemoteStore>>>,
    codec: Codec,
    prefix: String,
    timeout: Duration,
}

impl RemoteLayer {
    pub fn new(
        backend: Option<Arc<dyn RemoteStore>>,
        codec: Codec,
        prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        RemoteLayer {
            backend: RwLock::new(backend),
            codec,
            prefix: prefix.into(),
            timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend().is_some()
    }

    /// Name of the backing store, `"disabled"` when there is none.
    pub fn name(&self) -> &'static str {
        self.backend().map(|b| b.name()).unwrap_or("disabled")
    }

    /// Release the client. Every later call is a no-op.
    pub fn close(&self) {
        let mut backend = self.backend.write().unwrap_or_else(PoisonError::into_inner);
        if backend.take().is_some() {
            tracing::debug!(prefix = %self.prefix, "L2 client released");
        }
    }

    fn backend(&self) -> Option<Arc<dyn RemoteStore>> {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn qualify(&self, key: &str) -> String {
        build_cache_key(&self.prefix, key)
    }

    async fn call<T, Fut>(&self, op: &str, key: &str, fut: Fut) -> Result<T, CacheError>
    where
        Fut: Future<Output = Result<T, CacheError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::operation(
                "l2",
                key,
                format!("{} timed out after {:?}", op, self.timeout),
            )),
        }
    }

    /// Read and decode an entry. Failures, undecodable bytes and expired entries are misses.
    pub async fn get<V: DeserializeOwned>(&self, key: &str, now_ms: i64) -> Option<CacheEntry<V>> {
        let backend = self.backend()?;
        let qualified = self.qualify(key);

        let bytes = match self.call("GET", key, backend.get(&qualified)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "L2 read failed, treating as miss");
                return None;
            }
        };

        let entry: CacheEntry<V> = match self.codec.decode(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key, error = %e, "L2 entry could not be decoded, treating as miss");
                return None;
            }
        };

        if entry.is_expired(now_ms) {
            // Delete in background; the store's own TTL will catch it otherwise.
            tokio::spawn(async move {
                let _ = backend.delete(&[qualified]).await;
            });
            return None;
        }

        Some(entry)
    }

    /// Encode and write. Returns whether the write landed; failures are logged.
    pub async fn set<V: Serialize>(&self, key: &str, entry: &CacheEntry<V>, ttl: Duration) -> bool {
        let Some(backend) = self.backend() else {
            return false;
        };

        let bytes = match self.codec.encode(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key, error = %e, "L2 entry could not be encoded, skipping write");
                return false;
            }
        };

        match self
            .call("SET", key, backend.set(&self.qualify(key), bytes, ttl))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "L2 write failed");
                false
            }
        }
    }

    /// Delete unqualified keys. Returns how many existed.
    pub async fn delete(&self, keys: &[String]) -> u64 {
        let Some(backend) = self.backend() else {
            return 0;
        };
        if keys.is_empty() {
            return 0;
        }

        let qualified: Vec<String> = keys.iter().map(|k| self.qualify(k)).collect();
        let first = keys.first().map(String::as_str).unwrap_or_default();

        match self.call("DEL", first, backend.delete(&qualified)).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(count = keys.len(), error = %e, "L2 delete failed");
                0
            }
        }
    }

    /// Unqualified keys matching `pattern`.
    pub async fn keys(&self, pattern: &KeyPattern) -> Vec<String> {
        let Some(backend) = self.backend() else {
            return Vec::new();
        };

        let qualified = match KeyPattern::parse(&self.qualify(pattern.as_str())) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "L2 pattern rejected");
                return Vec::new();
            }
        };

        match self
            .call("KEYS", pattern.as_str(), backend.keys(&qualified))
            .await
        {
            Ok(keys) => keys
                .iter()
                .filter_map(|k| strip_cache_key(&self.prefix, k))
                .map(String::from)
                .collect(),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "L2 key enumeration failed");
                Vec::new()
            }
        }
    }

    /// Delete every key under this cache's prefix.
    pub async fn clear(&self) -> u64 {
        let Ok(all) = KeyPattern::parse(&WILDCARD.to_string()) else {
            return 0;
        };
        let keys = self.keys(&all).await;
        self.delete(&keys).await
    }

    pub async fn ping(&self) -> bool {
        let Some(backend) = self.backend() else {
            return false;
        };

        match self.call("PING", "", backend.ping()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "L2 health probe failed");
                false
            }
        }
    }

    pub async fn memory_usage(&self) -> u64 {
        let Some(backend) = self.backend() else {
            return 0;
        };

        match self.call("INFO", "", backend.memory_usage()).await {
            Ok(bytes) => bytes.unwrap_or(0),
            Err(e) => {
                tracing::debug!(error = %e, "L2 memory usage unavailable");
                0
            }
        }
    }
}

/// The write-only edge layer.
pub struct EdgeLayer {
    store: RwLock<Option<Arc<dyn EdgeStore>>>,
    codec: Codec,
    stats: Arc<StatsCollector>,
}

impl EdgeLayer {
    pub fn new(store: Arc<dyn EdgeStore>, codec: Codec, stats: Arc<StatsCollector>) -> Self {
        EdgeLayer {
            store: RwLock::new(Some(store)),
            codec,
            stats,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store().is_some()
    }

    pub fn close(&self) {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn store(&self) -> Option<Arc<dyn EdgeStore>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish in the background. The caller never learns the outcome.
    pub fn dispatch_put<V: Serialize>(&self, key: &str, entry: &CacheEntry<V>, ttl: Duration) {
        let Some(store) = self.store() else {
            return;
        };

        let bytes = match self.codec.encode(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key, error = %e, "L3 entry could not be encoded, skipping write");
                self.stats.record_write(Layer::L3, false);
                return;
            }
        };

        let stats = self.stats.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            match store.put(&key, bytes, ttl).await {
                Ok(()) => {
                    stats.record_write(Layer::L3, true);
                    tracing::debug!(tier = store.name(), key = %key, "published to edge");
                }
                Err(e) => {
                    stats.record_write(Layer::L3, false);
                    tracing::warn!(tier = store.name(), key = %key, error = %e, "edge write failed");
                }
            }
        });
    }

    /// Purge the edge. Returns whether the purge succeeded.
    pub async fn purge_all(&self) -> bool {
        let Some(store) = self.store() else {
            return false;
        };

        match store.purge_all().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(tier = store.name(), error = %e, "edge purge failed");
                false
            }
        }
    }
}
