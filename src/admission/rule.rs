//! Admission rules and the pattern-keyed rule registry.
//!
//! Rules are immutable values: reconfiguration replaces the rule at a pattern
//! key wholesale, never mutating a resident rule in place, so concurrent
//! readers can never observe a partially updated rule.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Rate limiting algorithm applied by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Continuously moving trailing interval over a weighted log.
    SlidingWindow,
    /// Continuously refilled token pool; admission deducts at check time.
    TokenBucket,
    /// Clock-aligned buckets that reset wholesale at the boundary.
    FixedWindow,
    /// Continuously draining accumulator plus a FIFO queue.
    LeakyBucket,
}

/// An admission rule for a family of operation names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Operation-name pattern this rule is keyed under. `*` matches any
    /// sequence of characters; a bare `*` is the catch-all.
    pub pattern: String,
    /// Maximum admitted weight per window.
    pub max_operations: u64,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Algorithm used to account admitted weight.
    pub algorithm: Algorithm,
    /// Token-bucket burst capacity. Must be at least `max_operations`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_size: Option<u64>,
    /// Optional identifier, used by temporary adjustments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl Rule {
    /// Create a rule with no burst size or id.
    pub fn new(pattern: impl Into<String>, max_operations: u64, window_ms: u64, algorithm: Algorithm) -> Self {
        Self {
            pattern: pattern.into(),
            max_operations,
            window_ms,
            algorithm,
            burst_size: None,
            rule_id: None,
        }
    }

    /// Set the burst size (token bucket capacity).
    pub fn with_burst(mut self, burst_size: u64) -> Self {
        self.burst_size = Some(burst_size);
        self
    }

    /// Effective capacity: burst size when set, otherwise `max_operations`.
    pub fn capacity(&self) -> u64 {
        self.burst_size.unwrap_or(self.max_operations)
    }

    /// Validate rule parameters.
    ///
    /// Rejects zero limits, zero windows, and burst sizes below the base
    /// limit. Called before a rule is installed; nothing is ever partially
    /// applied.
    pub fn validate(&self) -> Result<()> {
        if self.max_operations == 0 {
            return Err(EngineError::InvalidMaxOperations {
                pattern: self.pattern.clone(),
            });
        }
        if self.window_ms == 0 {
            return Err(EngineError::InvalidWindow {
                pattern: self.pattern.clone(),
            });
        }
        if let Some(burst) = self.burst_size {
            if burst < self.max_operations {
                return Err(EngineError::BurstBelowLimit {
                    pattern: self.pattern.clone(),
                    burst_size: burst,
                    max_operations: self.max_operations,
                });
            }
        }
        Ok(())
    }
}

/// Compile a `*` pattern into an anchored regex matcher.
///
/// Returns `None` for literal patterns (resolved by exact key lookup) and for
/// the rare pattern that fails to compile after escaping.
pub(crate) fn compile_pattern(pattern: &str) -> Option<Regex> {
    if !pattern.contains('*') {
        return None;
    }
    let expr = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
    match Regex::new(&expr) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Failed to compile rule pattern");
            None
        }
    }
}

/// Whether `pattern` matches the concrete operation `name`.
pub(crate) fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == name {
        return true;
    }
    compile_pattern(pattern).is_some_and(|re| re.is_match(name))
}

/// A registered rule plus its precompiled matcher and registration order.
#[derive(Debug)]
struct Registered {
    rule: Rule,
    matcher: Option<Regex>,
    /// Count of non-wildcard characters, used as the specificity measure.
    literal_len: usize,
    /// Monotonic registration sequence; breaks specificity ties toward the
    /// most recently registered pattern.
    seq: u64,
}

/// Stores admission rules keyed by operation-name pattern.
///
/// Thread-safe: reads take a short `RwLock` read guard and clone the resolved
/// rule out, so request paths never hold the registry lock across algorithm
/// work.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Registered>>,
    next_seq: AtomicU64,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the rule at its pattern key.
    ///
    /// The rule is assumed validated; the registry itself never rejects.
    pub fn insert(&self, rule: Rule) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let registered = Registered {
            matcher: compile_pattern(&rule.pattern),
            literal_len: rule.pattern.chars().filter(|c| *c != '*').count(),
            seq,
            rule,
        };
        let mut rules = self.rules.write();
        rules.insert(registered.rule.pattern.clone(), registered);
    }

    /// Remove the rule at `pattern`. Returns whether a rule existed.
    pub fn remove(&self, pattern: &str) -> bool {
        let mut rules = self.rules.write();
        let existed = rules.remove(pattern).is_some();
        if existed {
            debug!(pattern = %pattern, "Removed admission rule");
        }
        existed
    }

    /// Get the rule registered at exactly `pattern`.
    pub fn get(&self, pattern: &str) -> Option<Rule> {
        let rules = self.rules.read();
        rules.get(pattern).map(|r| r.rule.clone())
    }

    /// Snapshot of all registered rules, keyed by pattern.
    pub fn all(&self) -> HashMap<String, Rule> {
        let rules = self.rules.read();
        rules
            .iter()
            .map(|(k, r)| (k.clone(), r.rule.clone()))
            .collect()
    }

    /// Resolve the rule applicable to a concrete operation name.
    ///
    /// Exact key match wins outright. Otherwise every wildcard pattern is
    /// tested; the match with the greatest literal length is the most
    /// specific, and ties resolve to the most recently registered. `None`
    /// means the operation is unthrottled.
    pub fn resolve(&self, name: &str) -> Option<Rule> {
        let rules = self.rules.read();
        if let Some(exact) = rules.get(name) {
            return Some(exact.rule.clone());
        }

        rules
            .values()
            .filter(|r| r.matcher.as_ref().is_some_and(|re| re.is_match(name)))
            .max_by_key(|r| (r.literal_len, r.seq))
            .map(|r| r.rule.clone())
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Remove all rules.
    pub fn clear(&self) {
        self.rules.write().clear();
    }
}
