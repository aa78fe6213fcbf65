use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Write token attached to every entry.
///
/// Tokens handed out by one [`VersionSource`] are unique and strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Monotonic version generator owned by a coordinator.
#[derive(Debug)]
pub struct VersionSource {
    next: AtomicU64,
}

impl VersionSource {
    /// Seed the generator from a wall-clock reading so tokens stay increasing across restarts.
    pub fn seeded(now_ms: i64) -> Self {
        VersionSource {
            next: AtomicU64::new((now_ms.max(0) as u64).saturating_mul(1000)),
        }
    }

    pub fn next(&self) -> Version {
        Version(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A cache entry containing a value and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,

    /// Unix timestamp in milliseconds.
    /// The entry is visible strictly before this time and reads as a miss afterwards.
    pub expiry: i64,

    /// Token of the write that produced this entry.
    pub version: Version,

    /// Number of reads served by the layer holding this copy.
    pub hit_count: u64,
}

impl<V> CacheEntry<V> {
    /// Create a new cache entry.
    pub fn new(value: V, expiry: i64, version: Version) -> Self {
        CacheEntry {
            value,
            expiry,
            version,
            hit_count: 0,
        }
    }

    /// Check if the entry has expired and should not be used.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expiry
    }

    /// Milliseconds left before expiry, zero once expired.
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        (self.expiry - now_ms).max(0)
    }
}
