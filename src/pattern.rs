//! Compiled wildcard key patterns.
//!
//! A `*` matches any run of characters, including the `:` namespace separator.
//! Every other character matches itself. Patterns are compiled once into an
//! anchored regex so bulk deletes don't re-parse the template per key.

use regex::Regex;
use std::fmt;

use crate::error::CacheError;

/// The wildcard marker used in keys, templates and topics.
pub const WILDCARD: char = '*';

/// Returns `true` when the key contains a wildcard and must be treated as a pattern.
pub fn is_pattern(key: &str) -> bool {
    key.contains(WILDCARD)
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal,
    All,
    Glob(Regex),
}

/// A key or wildcard pattern, compiled for matching.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    matcher: Matcher,
}

impl KeyPattern {
    /// Compile a pattern. Empty patterns are rejected.
    pub fn parse(pattern: &str) -> Result<Self, CacheError> {
        if pattern.is_empty() {
            return Err(CacheError::invalid_pattern(pattern, "pattern is empty"));
        }

        let matcher = if !is_pattern(pattern) {
            Matcher::Literal
        } else if pattern.chars().all(|c| c == WILDCARD) {
            Matcher::All
        } else {
            let body = pattern
                .split(WILDCARD)
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let regex = Regex::new(&format!("^{}$", body))
                .map_err(|e| CacheError::invalid_pattern(pattern, e.to_string()))?;
            Matcher::Glob(regex)
        };

        Ok(KeyPattern {
            source: pattern.to_string(),
            matcher,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// `true` if the pattern has no wildcard.
    pub fn is_literal(&self) -> bool {
        matches!(self.matcher, Matcher::Literal)
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.matcher {
            Matcher::Literal => self.source == key,
            Matcher::All => true,
            Matcher::Glob(regex) => regex.is_match(key),
        }
    }

    /// Render as a Redis `MATCH` glob.
    ///
    /// Redis treats `?`, `[`, `]` and backslash as glob syntax, so they are escaped.
    pub fn to_redis_glob(&self) -> String {
        let mut glob = String::with_capacity(self.source.len() + 4);
        for c in self.source.chars() {
            if c == WILDCARD {
                glob.push(WILDCARD);
            } else {
                push_redis_literal(&mut glob, c);
            }
        }
        glob
    }
}

fn push_redis_literal(out: &mut String, c: char) {
    if matches!(c, '?' | '[' | ']' | '\\') {
        out.push('\\');
    }
    out.push(c);
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Check that `id` can be substituted into a template.
///
/// An id carrying a wildcard would widen a targeted delete into a pattern
/// delete, so it is rejected.
pub fn validate_id(id: &str) -> Result<(), CacheError> {
    if id.is_empty() || is_pattern(id) {
        return Err(CacheError::InvalidKey(id.to_string()));
    }
    Ok(())
}

/// A rule pattern template such as `order:*` or `order:user:*`.
///
/// The first `*` is the id slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    template: String,
    slot: Option<usize>,
}

impl KeyTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        let slot = template.find(WILDCARD);
        KeyTemplate { template, slot }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Substitute `id` into the id slot.
    ///
    /// Without an id, or without a slot, the template itself is the result,
    /// which is the "every key of this entity" form. Callers check `id` with
    /// [`validate_id`] first.
    pub fn resolve(&self, id: Option<&str>) -> String {
        match (self.slot, id) {
            (Some(slot), Some(id)) => {
                let mut resolved = String::with_capacity(self.template.len() + id.len());
                resolved.push_str(&self.template[..slot]);
                resolved.push_str(id);
                resolved.push_str(&self.template[slot + WILDCARD.len_utf8()..]);
                resolved
            }
            _ => self.template.clone(),
        }
    }
}
