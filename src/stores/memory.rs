use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::CacheError;
use crate::pattern::KeyPattern;
use crate::store::RemoteStore;
use crate::utils::{Clock, SystemClock, duration_ms, rand_simple};

/// Configuration for eviction on set operations.
#[derive(Debug, Clone)]
pub struct EvictOnSetConfig {
    /// Provide a number between 0 and 1 to calculate whether eviction should run on each set.
    ///
    /// - `1.0` -> run eviction on every `set`
    /// - `0.5` -> run eviction on every 2nd `set` (on average)
    /// - `0.0` -> disable eviction
    pub frequency: f64,

    /// Remove items until the number of items in the map is lower than `max_items`.
    pub max_items: usize,
}

/// Configuration for HashMapStore.
#[derive(Clone, Default)]
pub struct HashMapStoreConfig {
    /// Remove expired entries on every `set` operation.
    pub evict_on_set: Option<EvictOnSetConfig>,

    /// Clock used for TTL bookkeeping. Defaults to the system clock.
    pub clock: Option<Arc<dyn Clock>>,
}

/// Internal stored bytes with expiration time.
#[derive(Clone)]
struct StoredBytes {
    expires: i64,
    data: Vec<u8>,
}

/// In-process `RemoteStore` using a HashMap behind an async RwLock.
///
/// Share one instance between several coordinators (via `Arc`) to model a
/// shared L2 in tests and single-node deployments without Redis.
pub struct HashMapStore {
    state: RwLock<HashMap<String, StoredBytes>>,
    evict_on_set: Option<EvictOnSetConfig>,
    clock: Arc<dyn Clock>,
}

impl HashMapStore {
    /// Create a new HashMapStore with the given configuration.
    pub fn new(config: HashMapStoreConfig) -> Self {
        HashMapStore {
            state: RwLock::new(HashMap::new()),
            evict_on_set: config.evict_on_set,
            clock: config.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        }
    }

    /// Number of stored keys, expired ones included.
    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run eviction if configured and random check passes.
    async fn maybe_evict(&self) {
        let Some(ref config) = self.evict_on_set else {
            return;
        };

        // Check frequency
        if config.frequency <= 0.0 {
            return;
        }

        let should_evict = if config.frequency >= 1.0 {
            true
        } else {
            rand_simple() < config.frequency
        };

        if !should_evict {
            return;
        }

        let mut state = self.state.write().await;
        let now = self.clock.now_ms();

        // First delete all expired entries
        state.retain(|_, v| v.expires > now);

        // If still over max_items, remove the entries closest to expiry
        if state.len() > config.max_items {
            let mut entries: Vec<_> = state.iter().map(|(k, v)| (k.clone(), v.expires)).collect();
            entries.sort_by_key(|(_, expires)| *expires);

            let to_remove = state.len() - config.max_items;
            for (key, _) in entries.into_iter().take(to_remove) {
                state.remove(&key);
            }
        }
    }
}

#[async_trait]
impl RemoteStore for HashMapStore {
    fn name(&self) -> &'static str {
        "hashmap"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let state = self.state.read().await;

        let Some(stored) = state.get(key) else {
            return Ok(None);
        };

        let now = self.clock.now_ms();
        if stored.expires <= now {
            // Entry is expired, remove it
            drop(state);
            let mut state = self.state.write().await;
            state.remove(key);
            return Ok(None);
        }

        Ok(Some(stored.data.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let expires = self.clock.now_ms().saturating_add(duration_ms(ttl));

        {
            let mut state = self.state.write().await;
            state.insert(
                key.to_string(),
                StoredBytes {
                    expires,
                    data: value,
                },
            );
        }

        self.maybe_evict().await;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut state = self.state.write().await;

        let removed = keys.iter().filter(|key| state.remove(*key).is_some()).count();
        Ok(removed as u64)
    }

    async fn keys(&self, pattern: &KeyPattern) -> Result<Vec<String>, CacheError> {
        let state = self.state.read().await;
        let now = self.clock.now_ms();

        Ok(state
            .iter()
            .filter(|(key, stored)| stored.expires > now && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn memory_usage(&self) -> Result<Option<u64>, CacheError> {
        let state = self.state.read().await;
        let bytes = state
            .iter()
            .map(|(key, stored)| (key.len() + stored.data.len()) as u64)
            .sum();
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = HashMapStore::new(HashMapStoreConfig::default());

        // Initially empty
        let result = store.get("cache::key1").await.unwrap();
        assert!(result.is_none());

        store
            .set("cache::key1", b"value1".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let result = store.get("cache::key1").await.unwrap();
        assert_eq!(result.as_deref(), Some(&b"value1"[..]));

        let removed = store
            .delete(&["cache::key1".to_string(), "cache::missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let result = store.get("cache::key1").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_ttl_follows_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let store = HashMapStore::new(HashMapStoreConfig {
            clock: Some(clock.clone()),
            ..HashMapStoreConfig::default()
        });

        store
            .set("k", b"v".to_vec(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_millis(100));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_keys_by_pattern() {
        let store = HashMapStore::new(HashMapStoreConfig::default());
        for key in ["cache::order:1", "cache::order:2", "cache::user:1"] {
            store
                .set(key, b"x".to_vec(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let pattern = KeyPattern::parse("cache::order:*").unwrap();
        let mut keys = store.keys(&pattern).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache::order:1", "cache::order:2"]);
    }

    #[tokio::test]
    async fn test_evict_on_set_caps_size() {
        let store = HashMapStore::new(HashMapStoreConfig {
            evict_on_set: Some(EvictOnSetConfig {
                frequency: 1.0,
                max_items: 3,
            }),
            clock: None,
        });

        for i in 0..10u64 {
            store
                .set(&format!("k{}", i), vec![0], Duration::from_secs(60 + i))
                .await
                .unwrap();
        }

        assert_eq!(store.len().await, 3);
        // The longest-lived entries survive.
        assert!(store.get("k9").await.unwrap().is_some());
        assert!(store.get("k0").await.unwrap().is_none());
    }
}
