//! Construction-time configuration for the cache layers.
//!
//! Everything here is read once when the coordinator is built. There is no
//! runtime reconfiguration.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::codec::SerializationFormat;
use crate::error::CacheError;

/// Configuration for the in-process L1 layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// TTL applied when `set` is called without one.
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,

    /// Memory budget in bytes.
    pub memory_budget_bytes: u64,

    /// Estimated size of one entry, used to turn the budget into an item count.
    pub avg_item_bytes: u64,
}

impl L1Config {
    /// Maximum number of entries the budget allows (at least one).
    pub fn max_items(&self) -> u64 {
        (self.memory_budget_bytes / self.avg_item_bytes.max(1)).max(1)
    }
}

impl Default for L1Config {
    fn default() -> Self {
        L1Config {
            default_ttl: Duration::from_secs(300),
            memory_budget_bytes: 64 * 1024 * 1024,
            avg_item_bytes: 1024,
        }
    }
}

/// How the L2 Redis deployment is laid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum L2Topology {
    /// A single Redis server.
    ///
    /// Format: `redis://[username:password@]host[:port][/database]`
    Standalone { url: String },
    /// A Redis Cluster reachable through any of the listed seed nodes.
    Cluster { nodes: Vec<String> },
}

impl Default for L2Topology {
    fn default() -> Self {
        L2Topology::Standalone {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Configuration for the shared L2 layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L2Config {
    /// When `false` the coordinator runs L1-only and every L2 call is a no-op.
    pub enabled: bool,

    pub topology: L2Topology,

    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,

    /// Prefix that scopes this cache's keys inside the shared store.
    pub key_prefix: String,

    /// Upper bound on any single L2 round trip.
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,

    pub format: SerializationFormat,
}

impl Default for L2Config {
    fn default() -> Self {
        L2Config {
            enabled: false,
            topology: L2Topology::default(),
            default_ttl: Duration::from_secs(3600),
            key_prefix: "cache".to_string(),
            operation_timeout: Duration::from_millis(500),
            format: SerializationFormat::Json,
        }
    }
}

/// Edge providers known to the builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeProvider {
    /// No edge layer; writes are dropped.
    #[default]
    None,
    /// In-process recorder, useful for tests and local runs.
    Memory,
}

impl std::str::FromStr for EdgeProvider {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(EdgeProvider::None),
            "memory" => Ok(EdgeProvider::Memory),
            other => Err(CacheError::Config(format!("unknown edge provider '{}'", other))),
        }
    }
}

/// Configuration for the edge L3 layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L3Config {
    pub provider: EdgeProvider,

    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
}

impl Default for L3Config {
    fn default() -> Self {
        L3Config {
            provider: EdgeProvider::None,
            default_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1: L1Config,
    pub l2: L2Config,
    pub l3: L3Config,

    /// Number of warmup loaders run concurrently.
    pub warmup_batch_size: usize,

    /// Serialize concurrent misses for the same key inside this process.
    pub coalesce_loads: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            l1: L1Config::default(),
            l2: L2Config::default(),
            l3: L3Config::default(),
            warmup_batch_size: 10,
            coalesce_loads: true,
        }
    }
}

impl CacheConfig {
    /// Build a configuration from `CACHE_*` environment variables on top of the defaults.
    ///
    /// - `CACHE_L1_TTL_MS`, `CACHE_L1_MEMORY_BYTES`, `CACHE_L1_AVG_ITEM_BYTES`
    /// - `CACHE_L2_ENABLED`, `CACHE_REDIS_URL`, `CACHE_REDIS_CLUSTER_NODES` (comma separated)
    /// - `CACHE_L2_TTL_MS`, `CACHE_L2_PREFIX`, `CACHE_L2_TIMEOUT_MS`, `CACHE_L2_FORMAT` (`json`|`binary`)
    /// - `CACHE_L3_PROVIDER`, `CACHE_L3_TTL_MS`, `CACHE_WARMUP_BATCH`
    pub fn from_env() -> Result<Self, CacheError> {
        let mut config = CacheConfig::default();

        if let Some(ms) = env_parse::<u64>("CACHE_L1_TTL_MS")? {
            config.l1.default_ttl = Duration::from_millis(ms);
        }
        if let Some(bytes) = env_parse("CACHE_L1_MEMORY_BYTES")? {
            config.l1.memory_budget_bytes = bytes;
        }
        if let Some(bytes) = env_parse("CACHE_L1_AVG_ITEM_BYTES")? {
            config.l1.avg_item_bytes = bytes;
        }
        if let Some(enabled) = env_parse("CACHE_L2_ENABLED")? {
            config.l2.enabled = enabled;
        }
        if let Ok(nodes) = env::var("CACHE_REDIS_CLUSTER_NODES") {
            let nodes: Vec<String> = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect();
            if !nodes.is_empty() {
                config.l2.topology = L2Topology::Cluster { nodes };
            }
        } else if let Ok(url) = env::var("CACHE_REDIS_URL") {
            config.l2.topology = L2Topology::Standalone { url };
        }
        if let Some(ms) = env_parse::<u64>("CACHE_L2_TTL_MS")? {
            config.l2.default_ttl = Duration::from_millis(ms);
        }
        if let Ok(prefix) = env::var("CACHE_L2_PREFIX") {
            config.l2.key_prefix = prefix;
        }
        if let Some(ms) = env_parse::<u64>("CACHE_L2_TIMEOUT_MS")? {
            config.l2.operation_timeout = Duration::from_millis(ms);
        }
        if let Ok(format) = env::var("CACHE_L2_FORMAT") {
            config.l2.format = match format.to_ascii_lowercase().as_str() {
                "json" => SerializationFormat::Json,
                "binary" | "bincode" => SerializationFormat::Binary,
                other => {
                    return Err(CacheError::Config(format!(
                        "unknown serialization format '{}'",
                        other
                    )));
                }
            };
        }
        if let Ok(provider) = env::var("CACHE_L3_PROVIDER") {
            config.l3.provider = provider.parse()?;
        }
        if let Some(ms) = env_parse::<u64>("CACHE_L3_TTL_MS")? {
            config.l3.default_ttl = Duration::from_millis(ms);
        }
        if let Some(batch) = env_parse("CACHE_WARMUP_BATCH")? {
            config.warmup_batch_size = batch;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the coordinator cannot work with.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.warmup_batch_size == 0 {
            return Err(CacheError::Config("warmup_batch_size must be > 0".into()));
        }
        if self.l1.avg_item_bytes == 0 {
            return Err(CacheError::Config("l1.avg_item_bytes must be > 0".into()));
        }
        if self.l2.key_prefix.is_empty() || self.l2.key_prefix.contains('*') {
            return Err(CacheError::Config(
                "l2.key_prefix must be non-empty and free of wildcards".into(),
            ));
        }
        if let L2Topology::Cluster { nodes } = &self.l2.topology
            && nodes.is_empty()
        {
            return Err(CacheError::Config("l2 cluster topology needs at least one node".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, CacheError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CacheError::Config(format!("{} has an invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_translates_to_item_count() {
        let l1 = L1Config {
            memory_budget_bytes: 10 * 1024,
            avg_item_bytes: 1024,
            ..L1Config::default()
        };
        assert_eq!(l1.max_items(), 10);

        let tiny = L1Config {
            memory_budget_bytes: 10,
            avg_item_bytes: 1024,
            ..L1Config::default()
        };
        assert_eq!(tiny.max_items(), 1);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: CacheConfig = serde_json::from_str(
            r#"{
                "l1": { "default_ttl": 5000 },
                "l2": {
                    "enabled": true,
                    "topology": { "mode": "cluster", "nodes": ["redis://a:7000", "redis://b:7001"] },
                    "format": "binary"
                },
                "l3": { "provider": "memory" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.l1.default_ttl, Duration::from_secs(5));
        assert_eq!(config.l1.avg_item_bytes, 1024);
        assert!(config.l2.enabled);
        assert_eq!(config.l2.format, SerializationFormat::Binary);
        assert_eq!(config.l2.key_prefix, "cache");
        assert!(matches!(config.l2.topology, L2Topology::Cluster { ref nodes } if nodes.len() == 2));
        assert_eq!(config.l3.provider, EdgeProvider::Memory);
        assert_eq!(config.warmup_batch_size, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = CacheConfig {
            warmup_batch_size: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_edge_provider_parse() {
        assert_eq!("memory".parse::<EdgeProvider>().unwrap(), EdgeProvider::Memory);
        assert_eq!("".parse::<EdgeProvider>().unwrap(), EdgeProvider::None);
        assert!("akamai".parse::<EdgeProvider>().is_err());
    }
}
