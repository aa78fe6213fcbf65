use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Debounce slot identity: one pending timer per `(entity, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub entity: String,
    pub id: Option<String>,
}

impl SlotKey {
    pub fn new(entity: impl Into<String>, id: Option<&str>) -> Self {
        SlotKey {
            entity: entity.into(),
            id: id.map(String::from),
        }
    }
}

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    slots: Mutex<HashMap<SlotKey, Slot>>,
    next_generation: AtomicU64,
    superseded: AtomicU64,
}

impl Registry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SlotKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `key` if it still belongs to `generation`.
    fn release(&self, key: &SlotKey, generation: u64) -> bool {
        let mut slots = self.lock();
        match slots.get(key) {
            Some(slot) if slot.generation == generation => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Owns the pending delayed invalidations.
///
/// Scheduling an occupied slot aborts the older timer. A firing timer frees
/// its slot before running, so an event arriving during execution schedules
/// a fresh timer instead of being swallowed.
#[derive(Clone, Default)]
pub struct TimerRegistry {
    inner: Arc<Registry>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        TimerRegistry::default()
    }

    /// Run `task` after `delay`, replacing any timer pending for `key`.
    ///
    /// Returns whether an older timer was superseded.
    pub fn schedule<F, Fut>(&self, key: SlotKey, delay: Duration, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.inner);

        let mut slots = self.inner.lock();
        let slot_key = key.clone();
        // Spawned under the lock: the task cannot release its slot before it is registered.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if registry.release(&slot_key, generation) {
                task().await;
            }
        });

        let replaced = slots.insert(key, Slot { generation, handle });
        match replaced {
            Some(previous) => {
                previous.handle.abort();
                self.inner.superseded.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Cancel the timer pending for `key`, if any.
    pub fn cancel(&self, key: &SlotKey) -> bool {
        match self.inner.lock().remove(key) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer. Returns how many were cancelled.
    pub fn drain(&self) -> usize {
        let drained: Vec<Slot> = self.inner.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            slot.handle.abort();
        }
        drained.len()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_scheduled(&self, key: &SlotKey) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Timers replaced by a newer event before they fired.
    pub fn superseded(&self) -> u64 {
        self.inner.superseded.load(Ordering::Relaxed)
    }
}
