use moka::Expiry;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::L1Config;
use crate::entry::{CacheEntry, Version};
use crate::pattern::KeyPattern;
use crate::utils::Clock;

/// What the L1 cache actually holds per key.
///
/// The hit counter lives behind the `Arc` so reads can bump it without
/// re-inserting the slot (which would disturb recency).
/// A slot without a value is a health-check marker and never readable.
struct Slot<V> {
    value: Option<V>,
    expiry: i64,
    version: Version,
    ttl: Duration,
    hits: AtomicU64,
}

impl<V> Slot<V> {
    fn marker(now: i64) -> Self {
        Slot {
            value: None,
            expiry: now.saturating_add(PROBE_TTL.as_millis() as i64),
            version: Version(0),
            ttl: PROBE_TTL,
            hits: AtomicU64::new(0),
        }
    }

    fn is_live(&self, now: i64) -> bool {
        self.value.is_some() && now < self.expiry
    }
}

const PROBE_KEY: &str = "__health__";
const PROBE_TTL: Duration = Duration::from_secs(1);

/// Physical expiry for moka, derived from the TTL each slot was written with.
struct SlotExpiry;

impl<V> Expiry<String, Arc<Slot<V>>> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<Slot<V>>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<Slot<V>>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-process store, the L1 tier.
///
/// MokaStore provides:
/// - Least-recently-used eviction once the item budget is exceeded
/// - Lazy logical expiry: a read past `expiry` is a miss, checked against the injected clock
/// - Physical expiry in the background so dead entries don't pin memory
///
/// All operations are synchronous and never block on I/O.
pub struct MokaStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<String, Arc<Slot<V>>>,
    clock: Arc<dyn Clock>,
    avg_item_bytes: u64,
}

impl<V> MokaStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a new MokaStore sized from the memory budget.
    ///
    /// # Example
    /// ```ignore
    /// let config = L1Config {
    ///     memory_budget_bytes: 16 * 1024 * 1024,
    ///     avg_item_bytes: 512,
    ///     ..L1Config::default()
    /// };
    /// let store: MokaStore<User> = MokaStore::new(&config, Arc::new(SystemClock));
    /// ```
    pub fn new(config: &L1Config, clock: Arc<dyn Clock>) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_items())
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(SlotExpiry)
            .build();

        MokaStore {
            cache,
            clock,
            avg_item_bytes: config.avg_item_bytes,
        }
    }

    /// Return the entry if present and unexpired, counting the hit.
    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let slot = self.cache.get(key)?;
        let value = slot.value.as_ref()?;

        if self.clock.now_ms() >= slot.expiry {
            // Entry is expired, remove it
            self.cache.invalidate(key);
            return None;
        }

        let hit_count = slot.hits.fetch_add(1, Ordering::Relaxed) + 1;
        Some(CacheEntry {
            value: value.clone(),
            expiry: slot.expiry,
            version: slot.version,
            hit_count,
        })
    }

    /// Insert or overwrite. The entry's `expiry` is kept as given.
    pub fn set(&self, key: &str, entry: CacheEntry<V>) {
        let remaining = entry.remaining_ms(self.clock.now_ms()) as u64;
        let slot = Slot {
            value: Some(entry.value),
            expiry: entry.expiry,
            version: entry.version,
            ttl: Duration::from_millis(remaining),
            hits: AtomicU64::new(entry.hit_count),
        };
        self.cache.insert(key.to_string(), Arc::new(slot));
    }

    /// Remove a key. Returns whether a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.cache
            .remove(key)
            .is_some_and(|slot| slot.is_live(now))
    }

    /// Remove every key matching `pattern`, returning the live keys removed.
    ///
    /// Expired slots that match are dropped too but not reported.
    pub fn delete_matching(&self, pattern: &KeyPattern) -> Vec<String> {
        let now = self.clock.now_ms();
        let matching: Vec<(String, bool)> = self
            .cache
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, slot)| (key.as_ref().clone(), slot.is_live(now)))
            .collect();

        let mut removed = Vec::with_capacity(matching.len());
        for (key, live) in matching {
            self.cache.invalidate(&key);
            if live {
                removed.push(key);
            }
        }
        removed
    }

    /// Keys of all live entries.
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        self.cache
            .iter()
            .filter(|(_, slot)| slot.is_live(now))
            .map(|(key, _)| key.as_ref().clone())
            .collect()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    /// Approximate number of entries held.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Round-trip a marker slot through the cache under a reserved key.
    ///
    /// Healthy when the marker written is the one read back. The marker is
    /// removed afterwards and is never visible to `get` or `keys`.
    pub fn probe(&self) -> bool {
        let marker = Arc::new(Slot::marker(self.clock.now_ms()));

        self.cache.insert(PROBE_KEY.to_string(), Arc::clone(&marker));
        let read_back = self
            .cache
            .get(PROBE_KEY)
            .is_some_and(|slot| Arc::ptr_eq(&slot, &marker));
        self.cache.invalidate(PROBE_KEY);
        self.cache.run_pending_tasks();
        read_back
    }

    /// Estimated bytes held, from the average item size.
    pub fn memory_usage(&self) -> u64 {
        self.len() * self.avg_item_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    fn store(clock: Arc<ManualClock>) -> MokaStore<String> {
        MokaStore::new(&L1Config::default(), clock)
    }

    #[test]
    fn test_get_set_delete() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = store(clock);

        // Initially empty
        assert!(store.get("users:key1").is_none());

        store.set(
            "users:key1",
            CacheEntry::new("value1".to_string(), 61_000, Version(1)),
        );

        let entry = store.get("users:key1").unwrap();
        assert_eq!(entry.value, "value1");
        assert_eq!(entry.version, Version(1));

        assert!(store.delete("users:key1"));
        assert!(store.get("users:key1").is_none());
        assert!(!store.delete("users:key1"));
    }

    #[test]
    fn test_hit_count_increments() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock);
        store.set("k", CacheEntry::new("v".to_string(), 10_000, Version(1)));

        assert_eq!(store.get("k").unwrap().hit_count, 1);
        assert_eq!(store.get("k").unwrap().hit_count, 2);
        assert_eq!(store.get("k").unwrap().hit_count, 3);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock.clone());
        store.set("k", CacheEntry::new("v".to_string(), 5_000, Version(1)));

        clock.advance(Duration::from_millis(4_999));
        assert!(store.get("k").is_some());

        clock.advance(Duration::from_millis(1));
        assert!(store.get("k").is_none());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_delete_matching_leaves_other_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock);
        for key in ["ns:1", "ns:2:detail", "other:1"] {
            store.set(key, CacheEntry::new(key.to_string(), 60_000, Version(1)));
        }

        let pattern = KeyPattern::parse("ns:*").unwrap();
        let mut removed = store.delete_matching(&pattern);
        removed.sort();
        assert_eq!(removed, vec!["ns:1".to_string(), "ns:2:detail".to_string()]);

        assert!(store.get("ns:1").is_none());
        assert!(store.get("ns:2:detail").is_none());
        assert_eq!(store.get("other:1").unwrap().value, "other:1");
    }

    #[test]
    fn test_delete_matching_skips_expired_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock.clone());
        store.set("ns:old", CacheEntry::new("old".to_string(), 1_000, Version(1)));
        store.set("ns:new", CacheEntry::new("new".to_string(), 60_000, Version(2)));

        clock.advance(Duration::from_secs(2));
        let pattern = KeyPattern::parse("ns:*").unwrap();
        assert_eq!(store.delete_matching(&pattern), vec!["ns:new".to_string()]);
        assert!(store.delete_matching(&pattern).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_capacity_bounds_entry_count() {
        let clock = Arc::new(ManualClock::new(0));
        let config = L1Config {
            memory_budget_bytes: 4 * 1024,
            avg_item_bytes: 1024,
            ..L1Config::default()
        };
        let store: MokaStore<u32> = MokaStore::new(&config, clock);

        for i in 0..50u32 {
            store.set(&format!("k{}", i), CacheEntry::new(i, 60_000, Version(i as u64)));
        }

        assert!(store.len() <= 4);
    }

    #[test]
    fn test_probe_leaves_no_trace() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock);
        assert!(store.probe());
        assert!(store.is_empty());
        assert!(store.get(PROBE_KEY).is_none());

        store.set("a", CacheEntry::new("1".to_string(), 60_000, Version(1)));
        assert!(store.probe());
        assert_eq!(store.keys(), vec!["a".to_string()]);
    }

    #[test]
    fn test_marker_slot_is_never_readable() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock);
        store
            .cache
            .insert(PROBE_KEY.to_string(), Arc::new(Slot::marker(0)));

        assert!(store.get(PROBE_KEY).is_none());
        assert!(store.keys().is_empty());
        assert!(!store.delete(PROBE_KEY));
    }

    #[test]
    fn test_clear() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(clock);
        store.set("a", CacheEntry::new("1".to_string(), 60_000, Version(1)));
        store.set("b", CacheEntry::new("2".to_string(), 60_000, Version(2)));

        store.clear();
        assert!(store.keys().is_empty());
        assert!(store.is_empty());
    }
}
