use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::CacheError;
use crate::pattern::{KeyPattern, KeyTemplate};

/// Static invalidation configuration for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationRule {
    pub entity: String,
    /// Key templates; the first `*` of each is replaced by the event id.
    pub patterns: Vec<String>,
    /// Entities invalidated with the same id after this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Debounce window. Repeated events for the same id restart it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Also clear the user-scoped views of the event's `userId`.
    #[serde(default)]
    pub user_scoped: bool,
}

impl InvalidationRule {
    pub fn new(entity: impl Into<String>, patterns: &[&str]) -> Self {
        InvalidationRule {
            entity: entity.into(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            dependencies: Vec::new(),
            delay_ms: None,
            user_scoped: false,
        }
    }

    pub fn depends_on(mut self, entities: &[&str]) -> Self {
        self.dependencies = entities.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn user_scoped(mut self) -> Self {
        self.user_scoped = true;
        self
    }
}

/// A rule with its templates parsed.
#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub entity: String,
    pub templates: Vec<KeyTemplate>,
    pub dependencies: Vec<String>,
    pub delay: Option<Duration>,
    pub user_scoped: bool,
}

impl CompiledRule {
    fn compile(rule: InvalidationRule) -> Result<Self, CacheError> {
        let mut templates = Vec::with_capacity(rule.patterns.len());
        for pattern in &rule.patterns {
            // Parse once up front so a bad template fails at load, not at event time.
            KeyPattern::parse(pattern)?;
            templates.push(KeyTemplate::new(pattern.as_str()));
        }

        Ok(CompiledRule {
            entity: rule.entity,
            templates,
            dependencies: rule.dependencies,
            delay: rule.delay_ms.filter(|ms| *ms > 0).map(Duration::from_millis),
            user_scoped: rule.user_scoped,
        })
    }

    /// Concrete delete patterns for `id`.
    pub fn resolve(&self, id: Option<&str>) -> Vec<String> {
        self.templates.iter().map(|t| t.resolve(id)).collect()
    }
}

/// The immutable rule table, keyed by entity.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<String, CompiledRule>,
}

impl RuleSet {
    /// Compile a rule table.
    ///
    /// Duplicate entities and unparseable patterns are errors. Unknown
    /// dependencies and dependency cycles are logged; cascades skip them.
    pub fn new(rules: Vec<InvalidationRule>) -> Result<Self, CacheError> {
        let mut compiled = HashMap::with_capacity(rules.len());

        for rule in rules {
            if rule.entity.is_empty() {
                return Err(CacheError::Config("rule entity must not be empty".into()));
            }
            let entity = rule.entity.clone();
            if compiled.insert(entity.clone(), CompiledRule::compile(rule)?).is_some() {
                return Err(CacheError::Config(format!("duplicate rule for entity '{}'", entity)));
            }
        }

        let set = RuleSet { rules: compiled };
        set.report_graph_problems();
        Ok(set)
    }

    /// Load a JSON array of rules.
    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        let rules: Vec<InvalidationRule> =
            serde_json::from_str(json).map_err(|e| CacheError::Config(e.to_string()))?;
        RuleSet::new(rules)
    }

    pub(crate) fn get(&self, entity: &str) -> Option<&CompiledRule> {
        self.rules.get(entity)
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.rules.contains_key(entity)
    }

    /// Entity names, sorted.
    pub fn entities(&self) -> Vec<&str> {
        let mut entities: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        entities.sort_unstable();
        entities
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Entities that sit on a dependency cycle.
    pub fn cyclic_entities(&self) -> Vec<String> {
        let mut cyclic: Vec<String> = self
            .rules
            .keys()
            .filter(|entity| self.reaches(entity, entity))
            .cloned()
            .collect();
        cyclic.sort_unstable();
        cyclic
    }

    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack: Vec<&str> = vec![from];
        let mut seen: HashSet<&str> = HashSet::new();

        while let Some(entity) = stack.pop() {
            let Some(rule) = self.rules.get(entity) else {
                continue;
            };
            for dep in &rule.dependencies {
                if dep == target {
                    return true;
                }
                if seen.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
        false
    }

    fn report_graph_problems(&self) {
        for rule in self.rules.values() {
            for dep in &rule.dependencies {
                if !self.rules.contains_key(dep) {
                    tracing::warn!(entity = %rule.entity, dependency = %dep, "dependency has no rule");
                }
            }
        }

        let cyclic = self.cyclic_entities();
        if !cyclic.is_empty() {
            tracing::warn!(entities = ?cyclic, "dependency cycle in invalidation rules");
        }
    }
}
