//! Event-driven invalidation: a static rule table turned into pattern deletes.
//!
//! ```text
//! EventBus ──> RuleEngine ──(debounce)──> Invalidator::invalidate(pattern)
//!                  │
//!                  └── cascade to dependencies, same id
//! ```

use async_trait::async_trait;

use crate::error::CacheError;

mod engine;
mod rules;
mod timers;

pub use engine::{
    DEFAULT_CLEAR_CONFIRMATION, EngineConfig, EngineMetrics, InvalidationOutcome, InvalidationReport,
    PatternResult, RuleEngine,
};
pub use rules::{InvalidationRule, RuleSet};
pub use timers::{SlotKey, TimerRegistry};

/// What the rule engine invalidates against.
///
/// Implemented by [`TieredCache`](crate::TieredCache); tests can supply a recorder.
#[async_trait]
pub trait Invalidator: Send + Sync {
    /// Delete a literal key or every key matching a `*` pattern.
    ///
    /// Returns whether anything matched.
    async fn invalidate(&self, pattern: &str) -> Result<bool, CacheError>;

    /// Drop everything in every reachable layer.
    async fn clear_all(&self) -> Result<(), CacheError>;
}
