use async_trait::async_trait;
use std::time::Duration;

use crate::error::CacheError;
use crate::pattern::KeyPattern;

/// A shared, networked key-value store backing the L2 layer.
///
/// Remote stores are byte-oriented: the layer above encodes entries with the
/// configured codec and owns the key prefix. Keys handed to a store are
/// already fully qualified.
///
/// The store implementation is responsible for cleaning up expired data on its own;
/// `ttl` tells it how long the entry has to live.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// A name for metrics/tracing.
    ///
    /// # Example
    /// - "hashmap"
    /// - "redis"
    /// - "redis-cluster"
    fn name(&self) -> &'static str;

    /// Return the stored bytes, `None` for misses.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store bytes under `key` for `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Remove the keys. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Enumerate the fully qualified keys matching `pattern`.
    ///
    /// `pattern` already carries the key prefix.
    async fn keys(&self, pattern: &KeyPattern) -> Result<Vec<String>, CacheError>;

    /// Cheap liveness round trip.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Memory used by the store in bytes, when the backend reports it.
    async fn memory_usage(&self) -> Result<Option<u64>, CacheError> {
        Ok(None)
    }
}

/// An edge/CDN layer. Write-only from the cache's point of view.
#[async_trait]
pub trait EdgeStore: Send + Sync {
    /// A name for metrics/tracing.
    fn name(&self) -> &'static str;

    /// Publish bytes for `key` at the edge.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Drop everything this cache has published.
    async fn purge_all(&self) -> Result<(), CacheError>;
}
