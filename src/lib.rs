//! tiered-cache - A multi-tier cache with rule-driven invalidation for Rust
//!
//! This library provides:
//! - An L1 in-process cache (moka, LRU, lazy TTL)
//! - An optional shared L2 (Redis standalone or cluster) that degrades silently
//! - A write-only L3 edge layer, updated in the background
//! - A rule engine turning domain events into pattern deletes, with debounce
//!   and dependency cascades
//!
//! # Example
//!
//! ```ignore
//! use tiered_cache::{
//!     CacheConfig, EngineConfig, EventAction, EventBus, InvalidationEvent,
//!     InvalidationRule, RuleEngine, RuleSet, TieredCacheBuilder,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tiered_cache::CacheError> {
//!     let cache = TieredCacheBuilder::<String>::new(CacheConfig::from_env()?)
//!         .build()
//!         .await?;
//!
//!     // Read-through
//!     let profile = cache
//!         .get_or_load("user:1:profile", || async {
//!             Ok::<_, tiered_cache::CacheError>(Some("alice".to_string()))
//!         })
//!         .await?;
//!
//!     // Event-driven invalidation
//!     let rules = RuleSet::new(vec![
//!         InvalidationRule::new("user", &["user:*", "user:*:profile"]),
//!     ])?;
//!     let engine = RuleEngine::new(rules, Arc::new(cache.clone()), EngineConfig::default());
//!     let bus = EventBus::default();
//!     engine.listen(&bus)?;
//!
//!     bus.publish(InvalidationEvent::new("user", Some("1".into()), EventAction::Update));
//!     Ok(())
//! }
//! ```

mod builder;
mod codec;
mod config;
mod entry;
mod error;
pub mod events;
pub mod invalidation;
mod layer;
mod pattern;
mod stats;
mod store;
pub mod stores;
mod tiered;
mod utils;

// Re-export public API
pub use builder::TieredCacheBuilder;
pub use codec::{Codec, SerializationFormat};
pub use config::{CacheConfig, EdgeProvider, L1Config, L2Config, L2Topology, L3Config};
pub use entry::{CacheEntry, Version};
pub use error::CacheError;
pub use events::{EventAction, EventBus, InvalidationEvent, Subscription};
pub use invalidation::{
    EngineConfig, EngineMetrics, InvalidationOutcome, InvalidationReport, InvalidationRule,
    Invalidator, PatternResult, RuleEngine, RuleSet,
};
pub use pattern::{KeyPattern, KeyTemplate, is_pattern, validate_id};
pub use stats::{CacheStats, Layer, LayerStats, StatsCollector, StatsSampler};
pub use store::{EdgeStore, RemoteStore};
pub use stores::edge::{MemoryEdgeStore, NullEdgeStore};
pub use stores::memory::{EvictOnSetConfig, HashMapStore, HashMapStoreConfig};
pub use stores::moka::MokaStore;
pub use stores::redis::{RedisStore, RedisStoreConfig};
pub use tiered::{HealthStatus, TieredCache, WarmupEntry, WarmupReport};
pub use utils::{Clock, ManualClock, SystemClock};
