use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::CacheError;
use crate::store::EdgeStore;

/// Edge store for deployments without a CDN. Accepts and drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEdgeStore;

#[async_trait]
impl EdgeStore for NullEdgeStore {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn put(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn purge_all(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// A published edge object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeObject {
    pub body: Vec<u8>,
    pub ttl: Duration,
}

/// In-process edge store that keeps the last object published per key.
#[derive(Debug, Default)]
pub struct MemoryEdgeStore {
    objects: RwLock<HashMap<String, EdgeObject>>,
}

impl MemoryEdgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last object published for `key`.
    pub async fn object(&self, key: &str) -> Option<EdgeObject> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EdgeStore for MemoryEdgeStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), EdgeObject { body: value, ttl });
        Ok(())
    }

    async fn purge_all(&self) -> Result<(), CacheError> {
        self.objects.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_edge_put_and_purge() {
        let edge = MemoryEdgeStore::new();
        edge.put("product:1", b"{}".to_vec(), Duration::from_secs(30))
            .await
            .unwrap();

        let object = edge.object("product:1").await.unwrap();
        assert_eq!(object.ttl, Duration::from_secs(30));

        edge.purge_all().await.unwrap();
        assert!(edge.is_empty().await);
    }
}
