//! Core admission engine.
//!
//! Callers ask the engine to check-and-record before performing an expensive
//! operation. The engine resolves the applicable rule, dispatches on the
//! rule's algorithm (a tagged variant dispatch — token bucket commits at
//! check time, the window algorithms do not), reports the outcome to the
//! statistics collector, and returns a verdict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::error::Result;

use super::adjust::TemporaryAdjuster;
use super::bucket::TokenBucketStore;
use super::clock::{Clock, SystemClock};
use super::governor::{GovernorHandle, MemoryGovernor};
use super::rule::{pattern_matches, Algorithm, Rule, RuleRegistry};
use super::stats::{StatisticsCollector, StatsSnapshot};
use super::verdict::Verdict;
use super::window::WindowStore;

/// The admission engine: rule resolution, algorithm dispatch, statistics,
/// memory governance, and temporary adjustments behind one facade.
///
/// Thread-safe; share it behind an [`Arc`] across tasks. No engine call
/// blocks or suspends, so it is safe to call from latency-sensitive paths.
pub struct AdmissionEngine {
    registry: Arc<RuleRegistry>,
    windows: Arc<WindowStore>,
    buckets: Arc<TokenBucketStore>,
    stats: Arc<StatisticsCollector>,
    governor: Arc<MemoryGovernor>,
    adjuster: TemporaryAdjuster,
    governor_handle: Mutex<Option<GovernorHandle>>,
    clock: Arc<dyn Clock>,
}

impl AdmissionEngine {
    /// Create an engine from configuration, using the system clock.
    ///
    /// Every configured rule is validated before any is installed; an invalid
    /// rule rejects the whole configuration with nothing applied.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        for rule in &config.rules {
            rule.validate()?;
        }

        let registry = Arc::new(RuleRegistry::new());
        for rule in config.rules.clone() {
            registry.insert(rule);
        }

        let windows = Arc::new(WindowStore::new(config.governor.max_log_entries));
        let buckets = Arc::new(TokenBucketStore::new());
        let stats = Arc::new(StatisticsCollector::new(clock.now_ms()));
        let governor = Arc::new(MemoryGovernor::new(
            Arc::clone(&registry),
            Arc::clone(&windows),
            Arc::clone(&buckets),
            Arc::clone(&stats),
            Arc::clone(&clock),
            config.governor.clone(),
        ));

        Ok(Self {
            stats,
            adjuster: TemporaryAdjuster::new(Arc::clone(&registry)),
            registry,
            windows,
            buckets,
            governor,
            governor_handle: Mutex::new(None),
            clock,
        })
    }

    /// Create an engine with the startup default rules.
    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default()).expect("default engine configuration is valid")
    }

    /// Start the recurring governor schedule. Requires a tokio runtime.
    ///
    /// Idempotent: a second call while the schedule runs is a no-op.
    pub fn start(&self) {
        let mut handle = self.governor_handle.lock();
        if handle.is_none() {
            *handle = Some(Arc::clone(&self.governor).spawn());
        }
    }

    /// Pure admission evaluation.
    ///
    /// Read-only for the window-based algorithms. For token bucket the check
    /// also commits: the weight is deducted immediately so that concurrent
    /// checks cannot both observe sufficient tokens.
    pub fn check_limit(
        &self,
        operation: &str,
        weight: u64,
        metadata: Option<serde_json::Value>,
    ) -> Verdict {
        let now_ms = self.clock.now_ms();
        let Some(rule) = self.registry.resolve(operation) else {
            self.stats.record(operation, weight, true, now_ms);
            return Verdict::unthrottled(metadata);
        };

        trace!(
            operation = %operation,
            pattern = %rule.pattern,
            weight = weight,
            "Checking admission"
        );

        let verdict = match rule.algorithm {
            Algorithm::TokenBucket => {
                self.buckets.try_acquire(operation, &rule, weight, now_ms, metadata)
            }
            _ => self.windows.check(operation, &rule, weight, now_ms, metadata),
        };
        self.stats.record(operation, weight, verdict.allowed, now_ms);
        verdict
    }

    /// Commit a usage event, trusting that the caller previously checked it.
    ///
    /// No re-validation occurs. No-op for operations with no resolvable rule.
    pub fn record_usage(
        &self,
        operation: &str,
        weight: u64,
        metadata: Option<serde_json::Value>,
    ) {
        let now_ms = self.clock.now_ms();
        let Some(rule) = self.registry.resolve(operation) else {
            return;
        };

        match rule.algorithm {
            Algorithm::TokenBucket => self.buckets.deduct(operation, &rule, weight, now_ms),
            _ => {
                let total = self.windows.commit(operation, &rule, weight, now_ms, metadata);
                self.stats.observe_window_weight(total);
            }
        }
    }

    /// Check and, if allowed, record in one step. The primary entry point.
    ///
    /// The returned `remaining` reflects post-commit state.
    pub fn check_and_record(
        &self,
        operation: &str,
        weight: u64,
        metadata: Option<serde_json::Value>,
    ) -> Verdict {
        let now_ms = self.clock.now_ms();
        let Some(rule) = self.registry.resolve(operation) else {
            self.stats.record(operation, weight, true, now_ms);
            return Verdict::unthrottled(metadata);
        };

        let verdict = match rule.algorithm {
            Algorithm::TokenBucket => {
                self.buckets.try_acquire(operation, &rule, weight, now_ms, metadata)
            }
            _ => {
                let (verdict, total) =
                    self.windows.admit(operation, &rule, weight, now_ms, metadata);
                self.stats.observe_window_weight(total);
                verdict
            }
        };

        self.stats.record(operation, weight, verdict.allowed, now_ms);
        if !verdict.allowed {
            debug!(
                operation = %operation,
                pattern = %rule.pattern,
                weight = weight,
                retry_after_ms = ?verdict.retry_after_ms,
                "Admission denied"
            );
        }
        verdict
    }

    /// Validate and install a rule, replacing any rule at the same pattern
    /// and clearing windowed state for existing keys the pattern matches.
    pub fn configure_limit(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        let pattern = rule.pattern.clone();
        self.registry.insert(rule);

        // Stale capacity must not leak across a reconfiguration.
        self.windows.map().retain(|name, _| !pattern_matches(&pattern, name));
        self.buckets.map().retain(|name, _| !pattern_matches(&pattern, name));

        debug!(pattern = %pattern, "Configured admission rule");
        Ok(())
    }

    /// Remove the rule at `pattern`. Returns whether one existed.
    pub fn remove_limit(&self, pattern: &str) -> bool {
        self.registry.remove(pattern)
    }

    /// Get the rule registered at exactly `pattern`.
    pub fn get_limit(&self, pattern: &str) -> Option<Rule> {
        self.registry.get(pattern)
    }

    /// Read-only snapshot of all registered rules.
    pub fn all_limits(&self) -> HashMap<String, Rule> {
        self.registry.all()
    }

    /// Clear one operation's state, or all state, rules, and statistics when
    /// no operation is given.
    pub fn reset(&self, operation: Option<&str>) {
        match operation {
            Some(op) => {
                self.windows.remove(op);
                self.buckets.remove(op);
                self.stats.remove_operation(op);
                debug!(operation = %op, "Reset admission state");
            }
            None => {
                self.windows.clear();
                self.buckets.clear();
                self.registry.clear();
                self.stats.reset(self.clock.now_ms());
                debug!("Reset all admission state");
            }
        }
    }

    /// Statistics snapshot including derived rates and the governor's memory
    /// estimate.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.clock.now_ms(), self.governor.estimate_memory())
    }

    /// Run one governor sweep on demand. Returns the removed state count.
    pub fn cleanup(&self) -> usize {
        self.governor.sweep()
    }

    /// Temporarily scale the rule resolved for `operation`; see
    /// [`TemporaryAdjuster`]. Requires a tokio runtime for the reversion.
    pub fn adjust_limit(&self, operation: &str, multiplier: f64, duration: Duration) -> bool {
        self.adjuster.adjust(operation, multiplier, duration)
    }

    /// Stop the governor schedule and cancel pending reversions.
    pub fn shutdown(&self) {
        if let Some(handle) = self.governor_handle.lock().take() {
            handle.shutdown();
        }
        self.adjuster.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::clock::ManualClock;
    use crate::config::GovernorConfig;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("turnstile=debug")
            .with_test_writer()
            .try_init();
    }

    fn engine_with_rules(rules: Vec<Rule>) -> (AdmissionEngine, Arc<ManualClock>) {
        init_tracing();
        let clock = Arc::new(ManualClock::new(0));
        let config = EngineConfig {
            governor: GovernorConfig::default(),
            rules,
        };
        let engine = AdmissionEngine::with_clock(config, clock.clone()).unwrap();
        (engine, clock)
    }

    #[test]
    fn test_sliding_window_end_to_end() {
        let (engine, clock) = engine_with_rules(vec![Rule::new(
            "dom.*",
            5,
            1_000,
            Algorithm::SlidingWindow,
        )]);

        for _ in 0..5 {
            assert!(engine.check_and_record("dom.snapshot", 1, None).allowed);
        }
        let v = engine.check_and_record("dom.snapshot", 1, None);
        assert!(!v.allowed);
        assert_eq!(v.reset_ms, 1_000);

        clock.advance(1_001);
        assert!(engine.check_and_record("dom.snapshot", 1, None).allowed);
    }

    #[test]
    fn test_token_bucket_end_to_end() {
        let (engine, clock) = engine_with_rules(vec![Rule::new(
            "screenshot.*",
            10,
            1_000,
            Algorithm::TokenBucket,
        )]);

        for _ in 0..10 {
            assert!(engine.check_and_record("screenshot.viewport", 1, None).allowed);
        }
        let v = engine.check_and_record("screenshot.viewport", 1, None);
        assert!(!v.allowed);
        assert_eq!(v.retry_after_ms, Some(100));

        clock.advance(100);
        assert!(engine.check_and_record("screenshot.viewport", 1, None).allowed);
    }

    #[test]
    fn test_fixed_window_resets_without_smoothing() {
        let (engine, clock) = engine_with_rules(vec![Rule::new(
            "file.*",
            3,
            1_000,
            Algorithm::FixedWindow,
        )]);

        clock.set(999);
        for _ in 0..3 {
            assert!(engine.check_and_record("file.upload", 1, None).allowed);
        }
        assert!(!engine.check_and_record("file.upload", 1, None).allowed);

        // 1 ms later the grid boundary passes and history is discarded.
        clock.set(1_000);
        assert!(engine.check_and_record("file.upload", 1, None).allowed);
    }

    #[test]
    fn test_leaky_bucket_end_to_end() {
        let (engine, clock) = engine_with_rules(vec![Rule::new(
            "automation.*",
            4,
            1_000,
            Algorithm::LeakyBucket,
        )]);

        for _ in 0..4 {
            assert!(engine.check_and_record("automation.click", 1, None).allowed);
        }
        assert!(!engine.check_and_record("automation.click", 1, None).allowed);

        clock.advance(250);
        assert!(engine.check_and_record("automation.click", 1, None).allowed);
    }

    #[test]
    fn test_pattern_resolution_precedence() {
        let (engine, _clock) = engine_with_rules(vec![
            Rule::new("*", 100, 60_000, Algorithm::SlidingWindow),
            Rule::new("screenshot.*", 2, 60_000, Algorithm::SlidingWindow),
        ]);

        let v = engine.check_and_record("screenshot.viewport", 1, None);
        assert_eq!(v.rule.unwrap().pattern, "screenshot.*");

        let v = engine.check_and_record("nav.go", 1, None);
        assert_eq!(v.rule.unwrap().pattern, "*");
    }

    #[test]
    fn test_unconfigured_operation_fails_open() {
        let (engine, _clock) = engine_with_rules(vec![Rule::new(
            "screenshot.*",
            1,
            60_000,
            Algorithm::SlidingWindow,
        )]);

        let v = engine.check_and_record("nav.go", 1, None);
        assert!(v.allowed);
        assert_eq!(v.remaining, crate::admission::verdict::UNLIMITED);
        assert!(v.rule.is_none());

        // recordUsage on an unthrottled operation is a no-op.
        engine.record_usage("nav.go", 5, None);
        assert!(engine.windows.is_empty());
    }

    #[test]
    fn test_check_limit_does_not_commit_window_state() {
        let (engine, _clock) = engine_with_rules(vec![Rule::new(
            "dom.*",
            2,
            1_000,
            Algorithm::SlidingWindow,
        )]);

        for _ in 0..5 {
            assert!(engine.check_limit("dom.snapshot", 1, None).allowed);
        }
        // Only a record consumes capacity.
        engine.record_usage("dom.snapshot", 2, None);
        assert!(!engine.check_limit("dom.snapshot", 1, None).allowed);
    }

    #[test]
    fn test_configure_round_trip_and_remove() {
        let (engine, _clock) = engine_with_rules(vec![]);
        let rule = Rule::new("file.*", 5, 60_000, Algorithm::FixedWindow);

        engine.configure_limit(rule.clone()).unwrap();
        let fetched = engine.get_limit("file.*").unwrap();
        assert_eq!(fetched.max_operations, rule.max_operations);
        assert_eq!(fetched.window_ms, rule.window_ms);
        assert_eq!(fetched.algorithm, rule.algorithm);

        assert!(engine.remove_limit("file.*"));
        assert!(!engine.remove_limit("file.*"));
        assert!(engine.get_limit("file.*").is_none());
    }

    #[test]
    fn test_configure_rejects_invalid_without_installing() {
        let (engine, _clock) = engine_with_rules(vec![]);

        let bad = Rule::new("dom.*", 10, 60_000, Algorithm::TokenBucket).with_burst(5);
        assert!(engine.configure_limit(bad).is_err());
        assert!(engine.get_limit("dom.*").is_none());
    }

    #[test]
    fn test_configure_clears_matching_state() {
        let (engine, _clock) = engine_with_rules(vec![Rule::new(
            "dom.*",
            5,
            1_000,
            Algorithm::SlidingWindow,
        )]);

        for _ in 0..5 {
            engine.check_and_record("dom.snapshot", 1, None);
        }
        assert!(!engine.check_and_record("dom.snapshot", 1, None).allowed);

        // Reconfiguration wipes accumulated usage for matching keys.
        engine
            .configure_limit(Rule::new("dom.*", 5, 1_000, Algorithm::SlidingWindow))
            .unwrap();
        assert!(engine.check_and_record("dom.snapshot", 1, None).allowed);
    }

    #[test]
    fn test_reset_single_operation() {
        let (engine, _clock) = engine_with_rules(vec![Rule::new(
            "dom.*",
            2,
            60_000,
            Algorithm::SlidingWindow,
        )]);

        engine.check_and_record("dom.snapshot", 2, None);
        engine.check_and_record("dom.query", 2, None);
        assert!(!engine.check_and_record("dom.snapshot", 1, None).allowed);

        engine.reset(Some("dom.snapshot"));
        assert!(engine.check_and_record("dom.snapshot", 1, None).allowed);
        // Other operations keep their state.
        assert!(!engine.check_and_record("dom.query", 1, None).allowed);
    }

    #[test]
    fn test_full_reset_clears_rules_and_stats() {
        let (engine, _clock) = engine_with_rules(vec![Rule::new(
            "dom.*",
            1,
            60_000,
            Algorithm::SlidingWindow,
        )]);

        engine.check_and_record("dom.snapshot", 1, None);
        engine.reset(None);

        assert!(engine.all_limits().is_empty());
        assert_eq!(engine.stats().checked, 0);
        // Everything is unthrottled now.
        assert!(engine.check_and_record("dom.snapshot", 100, None).allowed);
    }

    #[test]
    fn test_stats_snapshot() {
        let (engine, clock) = engine_with_rules(vec![Rule::new(
            "dom.*",
            2,
            60_000,
            Algorithm::SlidingWindow,
        )]);

        engine.check_and_record("dom.snapshot", 1, None);
        engine.check_and_record("dom.snapshot", 1, None);
        engine.check_and_record("dom.snapshot", 1, None);

        clock.advance(1_000);
        let snap = engine.stats();
        assert_eq!(snap.checked, 3);
        assert_eq!(snap.allowed, 2);
        assert_eq!(snap.denied, 1);
        assert_eq!(snap.peak_window_weight, 2);
        assert!(snap.memory_estimate_bytes > 0);
        assert!((snap.ops_per_sec - 3.0).abs() < 1e-9);

        let op = &snap.per_operation["dom.snapshot"];
        assert_eq!(op.total_weight, 2);
    }

    #[test]
    fn test_cleanup_enforces_per_pattern_cap() {
        let clock = Arc::new(ManualClock::new(0));
        let config = EngineConfig {
            governor: GovernorConfig {
                per_pattern_cap: 3,
                ..GovernorConfig::default()
            },
            rules: vec![Rule::new("upload.*", 100, 60_000, Algorithm::SlidingWindow)],
        };
        let engine = AdmissionEngine::with_clock(config, clock).unwrap();

        for i in 0..50 {
            let name = format!("upload.f47ac10b-58cc-4372-a567-0e02b2c3d4{:02}", i);
            engine.check_and_record(&name, 1, None);
        }
        assert_eq!(engine.windows.len(), 50);

        engine.cleanup();
        assert_eq!(engine.windows.len(), 3);
    }

    #[test]
    fn test_cleanup_bounds_per_operation_stats() {
        let clock = Arc::new(ManualClock::new(0));
        let config = EngineConfig {
            governor: GovernorConfig {
                max_tracked_operations: 8,
                ..GovernorConfig::default()
            },
            rules: vec![Rule::new("upload.*", 100, 60_000, Algorithm::SlidingWindow)],
        };
        let engine = AdmissionEngine::with_clock(config, clock).unwrap();

        for i in 0..50 {
            let name = format!("upload.f47ac10b-58cc-4372-a567-0e02b2c3d4{:02}", i);
            engine.check_and_record(&name, 1, None);
        }
        assert_eq!(engine.stats().per_operation.len(), 50);

        engine.cleanup();
        let snap = engine.stats();
        assert_eq!(snap.per_operation.len(), 8);
        // Pruning per-operation counters never rewrites the totals.
        assert_eq!(snap.checked, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adjust_limit_reverts() {
        let (engine, _clock) = engine_with_rules(vec![Rule::new(
            "screenshot.*",
            10,
            60_000,
            Algorithm::SlidingWindow,
        )]);

        assert!(engine.adjust_limit("screenshot.viewport", 0.5, Duration::from_millis(50)));
        assert_eq!(engine.get_limit("screenshot.*").unwrap().max_operations, 5);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.get_limit("screenshot.*").unwrap().max_operations, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let (engine, _clock) = engine_with_rules(vec![Rule::new(
            "dom.*",
            5,
            1_000,
            Algorithm::SlidingWindow,
        )]);

        engine.start();
        // Second start is a no-op.
        engine.start();
        engine.adjust_limit("dom.snapshot", 0.5, Duration::from_secs(10));

        engine.shutdown();
        tokio::time::sleep(Duration::from_secs(11)).await;
        // The cancelled reversion never fired.
        assert_eq!(engine.get_limit("dom.*").unwrap().max_operations, 2);
    }
}
