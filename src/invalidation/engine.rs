use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

use super::Invalidator;
use super::rules::RuleSet;
use super::timers::{SlotKey, TimerRegistry};
use crate::error::CacheError;
use crate::events::{EventAction, EventBus, InvalidationEvent};
use crate::pattern::{KeyTemplate, validate_id};

/// Token `global_clear` expects unless configured otherwise.
pub const DEFAULT_CLEAR_CONFIRMATION: &str = "CONFIRM_GLOBAL_CLEAR";

const USER_SCOPE: &str = "user-scope";

/// Engine settings that are not part of the rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Exact token `global_clear` must be called with.
    pub clear_confirmation: String,
    /// Patterns cleared by `invalidate_user_scoped`; `{user_id}` is substituted.
    pub user_scope_templates: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            clear_confirmation: DEFAULT_CLEAR_CONFIRMATION.to_string(),
            user_scope_templates: vec![
                "user:{user_id}:*".to_string(),
                "order:user:{user_id}*".to_string(),
                "position:user:{user_id}*".to_string(),
                "withdrawal:user:{user_id}*".to_string(),
                "risk:user:{user_id}*".to_string(),
            ],
        }
    }
}

/// The outcome of one pattern delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternResult {
    /// Entity whose rule produced the pattern, or `"user-scope"`.
    pub entity: String,
    pub pattern: String,
    /// `Ok(matched)` or the error the invalidator returned.
    pub result: Result<bool, CacheError>,
}

impl PatternResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Everything one executed invalidation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub entity: String,
    pub id: Option<String>,
    /// Every pattern delete issued, root, cascade and user scope alike.
    pub patterns: Vec<PatternResult>,
    /// Dependencies processed inline, in visiting order.
    pub cascaded: Vec<String>,
    /// Dependencies deferred onto their own debounce timer.
    pub scheduled: Vec<String>,
    /// Dependencies not processed: already visited or without a rule.
    pub skipped: Vec<String>,
}

impl InvalidationReport {
    fn new(entity: &str, id: Option<&str>) -> Self {
        InvalidationReport {
            entity: entity.to_string(),
            id: id.map(String::from),
            ..InvalidationReport::default()
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &PatternResult> {
        self.patterns.iter().filter(|p| !p.is_ok())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Patterns issued for `entity`.
    pub fn patterns_for<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.patterns
            .iter()
            .filter(move |p| p.entity == entity)
            .map(|p| p.pattern.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationOutcome {
    /// No rule for the event's entity.
    NoRule,
    /// A debounce timer was started; `superseded` if it replaced a pending one.
    Scheduled { superseded: bool },
    /// The engine is shut down.
    Skipped,
    /// The event's id cannot be used as a key segment.
    Rejected(CacheError),
    Executed(InvalidationReport),
}

impl InvalidationOutcome {
    pub fn report(&self) -> Option<&InvalidationReport> {
        match self {
            InvalidationOutcome::Executed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub events_handled: u64,
    pub executions: u64,
    pub pattern_failures: u64,
    pub unknown_entities: u64,
    pub rejected_events: u64,
    pub timers_superseded: u64,
    pub timers_pending: usize,
}

#[derive(Default)]
struct Counters {
    events: AtomicU64,
    executions: AtomicU64,
    failures: AtomicU64,
    unknown: AtomicU64,
    rejected: AtomicU64,
}

struct EngineInner {
    rules: RuleSet,
    target: Arc<dyn Invalidator>,
    config: EngineConfig,
    user_templates: Vec<KeyTemplate>,
    timers: TimerRegistry,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
    closed: AtomicBool,
}

/// Turns domain events into cache invalidations.
///
/// For each event the engine looks up the entity's rule, optionally debounces
/// it per `(entity, id)`, deletes every resolved pattern concurrently, then
/// cascades to the rule's dependencies with the same id. A failing pattern
/// never stops its siblings or the cascade.
///
/// `RuleEngine` is cheap to clone; clones share timers and listeners.
#[derive(Clone)]
pub struct RuleEngine {
    inner: Arc<EngineInner>,
}

impl RuleEngine {
    pub fn new(rules: RuleSet, target: Arc<dyn Invalidator>, config: EngineConfig) -> Self {
        let user_templates = config
            .user_scope_templates
            .iter()
            .map(|t| KeyTemplate::new(t.replace("{user_id}", "*")))
            .collect();

        RuleEngine {
            inner: Arc::new(EngineInner {
                rules,
                target,
                config,
                user_templates,
                timers: TimerRegistry::new(),
                listeners: Mutex::new(Vec::new()),
                counters: Counters::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.inner.rules
    }

    /// Process one event.
    pub async fn handle_event(&self, event: InvalidationEvent) -> InvalidationOutcome {
        let inner = &self.inner;
        inner.counters.events.fetch_add(1, Ordering::Relaxed);

        if inner.closed.load(Ordering::Acquire) {
            tracing::debug!(topic = %event.topic(), "engine shut down, event ignored");
            return InvalidationOutcome::Skipped;
        }

        if let Some(Err(e)) = event.id.as_deref().map(validate_id) {
            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(entity = %event.entity, id = ?event.id, "event id rejected");
            return InvalidationOutcome::Rejected(e);
        }

        let Some(rule) = inner.rules.get(&event.entity) else {
            inner.counters.unknown.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(entity = %event.entity, "no invalidation rule for entity");
            return InvalidationOutcome::NoRule;
        };

        if let Some(delay) = rule.delay {
            let superseded = self.schedule(event, delay);
            return InvalidationOutcome::Scheduled { superseded };
        }

        InvalidationOutcome::Executed(self.execute(&event, false).await)
    }

    /// Invalidate `entity` (and its dependencies) as if it had just been updated.
    pub async fn manual_invalidate(
        &self,
        entity: &str,
        id: Option<&str>,
        reason: Option<&str>,
    ) -> InvalidationOutcome {
        let mut event = InvalidationEvent::new(entity, id.map(String::from), EventAction::Update);
        if let Some(reason) = reason {
            event = event.with_metadata("reason", reason);
        }
        tracing::info!(entity, id, reason, "manual invalidation");
        self.handle_event(event).await
    }

    /// [`manual_invalidate`](Self::manual_invalidate) for every item, concurrently.
    pub async fn batch_invalidate(&self, items: &[(String, Option<String>)]) -> Vec<InvalidationOutcome> {
        join_all(
            items
                .iter()
                .map(|(entity, id)| self.manual_invalidate(entity, id.as_deref(), Some("batch"))),
        )
        .await
    }

    /// Cancel every pending timer and clear every layer.
    ///
    /// Fails with [`CacheError::Confirmation`] before doing anything unless
    /// `token` is exactly the configured confirmation.
    pub async fn global_clear(&self, token: &str) -> Result<(), CacheError> {
        if token != self.inner.config.clear_confirmation {
            tracing::warn!("global clear rejected: bad confirmation token");
            return Err(CacheError::Confirmation);
        }

        let cancelled = self.inner.timers.drain();
        self.inner.target.clear_all().await?;
        tracing::warn!(cancelled_timers = cancelled, "global cache clear executed");
        Ok(())
    }

    /// Clear every user-scoped view of `user_id`.
    ///
    /// A `user_id` that fails [`validate_id`] deletes nothing and comes back
    /// as a single failed result.
    pub async fn invalidate_user_scoped(&self, user_id: &str) -> Vec<PatternResult> {
        if let Err(e) = validate_id(user_id) {
            self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(user_id, "user id rejected for user-scoped invalidation");
            return vec![PatternResult {
                entity: USER_SCOPE.to_string(),
                pattern: user_id.to_string(),
                result: Err(e),
            }];
        }

        let patterns = self
            .inner
            .user_templates
            .iter()
            .map(|t| t.resolve(Some(user_id)))
            .collect();
        let results = self.delete_patterns(USER_SCOPE, patterns).await;
        tracing::debug!(user_id, patterns = results.len(), "user-scoped invalidation");
        results
    }

    /// Feed events from `bus` into the engine, one listener per rule entity.
    pub fn listen(&self, bus: &EventBus) -> Result<(), CacheError> {
        let mut handles = Vec::with_capacity(self.inner.rules.len());

        for entity in self.inner.rules.entities() {
            let mut subscription = bus.subscribe(&format!("{}.*", entity))?;
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    engine.handle_event(event).await;
                }
            }));
        }

        tracing::info!(entities = handles.len(), "invalidation listeners started");
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        Ok(())
    }

    /// Stop listening and cancel every pending timer.
    ///
    /// Returns how many timers were cancelled.
    pub fn shutdown(&self) -> usize {
        self.inner.closed.store(true, Ordering::Release);

        let listeners: Vec<JoinHandle<()>> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for listener in &listeners {
            listener.abort();
        }

        let cancelled = self.inner.timers.drain();
        tracing::info!(listeners = listeners.len(), cancelled_timers = cancelled, "rule engine shut down");
        cancelled
    }

    pub fn metrics(&self) -> EngineMetrics {
        let counters = &self.inner.counters;
        EngineMetrics {
            events_handled: counters.events.load(Ordering::Relaxed),
            executions: counters.executions.load(Ordering::Relaxed),
            pattern_failures: counters.failures.load(Ordering::Relaxed),
            unknown_entities: counters.unknown.load(Ordering::Relaxed),
            rejected_events: counters.rejected.load(Ordering::Relaxed),
            timers_superseded: self.inner.timers.superseded(),
            timers_pending: self.inner.timers.pending(),
        }
    }

    /// Debounce `event` on its `(entity, id)` slot.
    fn schedule(&self, event: InvalidationEvent, delay: std::time::Duration) -> bool {
        let key = SlotKey::new(event.entity.as_str(), event.id.as_deref());
        tracing::debug!(entity = %event.entity, id = ?event.id, delay_ms = delay.as_millis() as u64, "invalidation scheduled");

        let engine = self.clone();
        self.inner.timers.schedule(key, delay, move || async move {
            engine.execute(&event, true).await;
        })
    }

    /// Steps after the debounce: patterns, cascade, user scope.
    ///
    /// `reentry` marks a timer-fired run; its cascade does not debounce again.
    async fn execute(&self, event: &InvalidationEvent, reentry: bool) -> InvalidationReport {
        let id = event.id.as_deref();
        let mut report = InvalidationReport::new(&event.entity, id);
        let mut visited = HashSet::new();

        self.process(&event.entity, id, event, reentry, &mut report, &mut visited)
            .await;

        let user_scoped = self
            .inner
            .rules
            .get(&event.entity)
            .is_some_and(|rule| rule.user_scoped);
        if user_scoped && let Some(user_id) = event.user_id() {
            report.patterns.extend(self.invalidate_user_scoped(&user_id).await);
        }

        self.inner.counters.executions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            entity = %event.entity,
            id,
            patterns = report.patterns.len(),
            failed = report.failures().count(),
            cascaded = report.cascaded.len(),
            "invalidation executed"
        );
        report
    }

    fn process<'a>(
        &'a self,
        entity: &'a str,
        id: Option<&'a str>,
        event: &'a InvalidationEvent,
        reentry: bool,
        report: &'a mut InvalidationReport,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !visited.insert(entity.to_string()) {
                tracing::warn!(entity, root = %event.entity, "dependency cycle, entity already invalidated");
                report.skipped.push(entity.to_string());
                return;
            }

            let Some(rule) = self.inner.rules.get(entity) else {
                tracing::warn!(entity, root = %event.entity, "dependency has no rule, skipping");
                report.skipped.push(entity.to_string());
                return;
            };

            let results = self.delete_patterns(entity, rule.resolve(id)).await;
            report.patterns.extend(results);

            for dependency in &rule.dependencies {
                let delay = self.inner.rules.get(dependency).and_then(|dep| dep.delay);
                match delay {
                    Some(delay) if !reentry && !visited.contains(dependency) => {
                        let cascaded = InvalidationEvent {
                            entity: dependency.clone(),
                            ..event.clone()
                        };
                        self.schedule(cascaded, delay);
                        report.scheduled.push(dependency.clone());
                    }
                    _ => {
                        if !visited.contains(dependency) && self.inner.rules.contains(dependency) {
                            report.cascaded.push(dependency.clone());
                        }
                        self.process(dependency, id, event, reentry, report, visited)
                            .await;
                    }
                }
            }
        })
    }

    async fn delete_patterns(&self, entity: &str, patterns: Vec<String>) -> Vec<PatternResult> {
        let target = &self.inner.target;
        let results = join_all(patterns.iter().map(|pattern| target.invalidate(pattern))).await;

        patterns
            .into_iter()
            .zip(results)
            .map(|(pattern, result)| {
                if let Err(e) = &result {
                    self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(entity, pattern = %pattern, error = %e, "pattern invalidation failed");
                }
                PatternResult {
                    entity: entity.to_string(),
                    pattern,
                    result,
                }
            })
            .collect()
    }
}
