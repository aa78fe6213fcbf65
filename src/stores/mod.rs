//! Store implementations for the cache layers.

pub mod edge;
pub mod memory;
pub mod moka;
pub mod redis;

pub use edge::{EdgeObject, MemoryEdgeStore, NullEdgeStore};
pub use memory::{EvictOnSetConfig, HashMapStore, HashMapStoreConfig};
pub use moka::MokaStore;
pub use redis::{RedisStore, RedisStoreConfig};
