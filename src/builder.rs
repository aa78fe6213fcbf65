//! Builder API for assembling a [`TieredCache`] from configuration.
//!
//! The builder connects the remote layer, picks the edge provider and wires
//! the clock. Anything it would connect on its own can be injected instead,
//! which is how tests share one in-process L2 between several caches.

use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::{CacheConfig, EdgeProvider};
use crate::error::CacheError;
use crate::store::{EdgeStore, RemoteStore};
use crate::stores::edge::{MemoryEdgeStore, NullEdgeStore};
use crate::stores::redis::{RedisStore, RedisStoreConfig};
use crate::tiered::TieredCache;
use crate::utils::{Clock, SystemClock};

/// Builder for [`TieredCache`].
///
/// # Example
///
/// ```ignore
/// use tiered_cache::{CacheConfig, TieredCacheBuilder};
///
/// let cache = TieredCacheBuilder::<User>::new(CacheConfig::from_env()?)
///     .build()
///     .await?;
///
/// cache.set("user:42", user, None).await?;
/// ```
pub struct TieredCacheBuilder<V> {
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    remote_store: Option<Arc<dyn RemoteStore>>,
    edge_store: Option<Arc<dyn EdgeStore>>,
    _value: PhantomData<fn() -> V>,
}

impl<V> TieredCacheBuilder<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        TieredCacheBuilder {
            config,
            clock: None,
            remote_store: None,
            edge_store: None,
            _value: PhantomData,
        }
    }

    /// Clock used for expiry checks. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use this store as L2 instead of connecting to Redis.
    ///
    /// An injected store enables L2 regardless of `l2.enabled`.
    pub fn remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote_store = Some(store);
        self
    }

    /// Use this store as L3 instead of the configured provider.
    pub fn edge_store(mut self, store: Arc<dyn EdgeStore>) -> Self {
        self.edge_store = Some(store);
        self
    }

    /// Validate the configuration and connect the layers.
    ///
    /// An unreachable Redis is not an error: the cache starts without L2.
    pub async fn build(self) -> Result<TieredCache<V>, CacheError> {
        self.config.validate()?;

        let remote = match self.remote_store {
            Some(store) => Some(store),
            None if self.config.l2.enabled => {
                let redis_config = RedisStoreConfig {
                    topology: self.config.l2.topology.clone(),
                    ..RedisStoreConfig::default()
                };
                match RedisStore::new(redis_config).await {
                    Ok(store) => Some(Arc::new(store) as Arc<dyn RemoteStore>),
                    Err(e) => {
                        tracing::warn!(error = %e, "L2 unavailable, continuing with L1 only");
                        None
                    }
                }
            }
            None => None,
        };

        let edge = self.edge_store.unwrap_or_else(|| match self.config.l3.provider {
            EdgeProvider::None => Arc::new(NullEdgeStore) as Arc<dyn EdgeStore>,
            EdgeProvider::Memory => Arc::new(MemoryEdgeStore::new()),
        });

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        Ok(TieredCache::new(self.config, remote, edge, clock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::{HashMapStore, HashMapStoreConfig};
    use crate::utils::ManualClock;

    #[tokio::test]
    async fn test_build_l1_only_by_default() {
        let cache = TieredCacheBuilder::<String>::new(CacheConfig::default())
            .build()
            .await
            .unwrap();

        assert!(!cache.l2_enabled());
        cache.set("user:1", "alice".to_string(), None).await.unwrap();
        assert_eq!(cache.get("user:1").await, Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_injected_remote_store_enables_l2() {
        let store = Arc::new(HashMapStore::new(HashMapStoreConfig::default()));
        let cache = TieredCacheBuilder::<String>::new(CacheConfig::default())
            .clock(Arc::new(ManualClock::new(1_000)))
            .remote_store(store.clone())
            .build()
            .await
            .unwrap();

        assert!(cache.l2_enabled());
        cache.set("user:1", "alice".to_string(), None).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = CacheConfig::default();
        config.warmup_batch_size = 0;

        let result = TieredCacheBuilder::<String>::new(config).build().await;
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_redis_degrades_to_l1() {
        let mut config = CacheConfig::default();
        config.l2.enabled = true;
        config.l2.topology = crate::config::L2Topology::Standalone {
            url: "redis://127.0.0.1:1".to_string(),
        };

        let cache = TieredCacheBuilder::<String>::new(config).build().await.unwrap();
        assert!(!cache.l2_enabled());
        assert!(!cache.health_check().await.l2);
    }
}
