//! Per-operation time-windowed state and the three window-based algorithms.
//!
//! One [`WindowState`] exists per concrete operation name for rules using the
//! sliding-window, fixed-window, or leaky-bucket algorithm. State lives in a
//! [`DashMap`] so mutations are serialized per key without a global lock.
//!
//! `check` methods are read-only; `admit` performs check-and-commit under a
//! single entry guard so two concurrent admissions cannot both observe free
//! capacity; `commit` appends unconditionally, trusting the caller.

use std::collections::VecDeque;

use dashmap::DashMap;
use tracing::trace;

use super::rule::{Algorithm, Rule};
use super::verdict::Verdict;

/// One recorded usage event.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// When the operation was admitted, epoch milliseconds.
    pub timestamp_ms: u64,
    /// Caller-assigned relative cost.
    pub weight: u64,
    /// Caller-supplied metadata, retained for diagnostics and accounted
    /// against the memory budget.
    pub metadata: Option<serde_json::Value>,
}

/// Mutable windowed state for one concrete operation name.
#[derive(Debug)]
pub struct WindowState {
    /// Start of the current window. Only meaningful for fixed windows, where
    /// it is quantized to the absolute clock grid.
    pub window_start_ms: u64,
    /// Ordered log of admitted entries (FIFO queue for leaky bucket).
    pub log: VecDeque<LogEntry>,
    /// Cached sum of weights of entries currently in the log.
    pub total_weight: u64,
    /// Continuous accumulator level, leaky bucket only.
    pub level: f64,
    /// Last time the leaky level was drained.
    pub last_leak_ms: u64,
    /// Last check or record that touched this window.
    pub last_activity_ms: u64,
}

impl WindowState {
    fn new(now_ms: u64) -> Self {
        Self {
            window_start_ms: now_ms,
            log: VecDeque::new(),
            total_weight: 0,
            level: 0.0,
            last_leak_ms: now_ms,
            last_activity_ms: now_ms,
        }
    }

    /// Drop entries at or past the trailing-window cutoff, keeping the cached
    /// total weight consistent with the retained log.
    fn prune_sliding(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while let Some(front) = self.log.front() {
            if front.timestamp_ms <= cutoff {
                self.total_weight = self.total_weight.saturating_sub(front.weight);
                self.log.pop_front();
            } else {
                break;
            }
        }
    }

    /// In-window weight without mutating the log.
    fn sliding_weight(&self, now_ms: u64, window_ms: u64) -> u64 {
        let cutoff = now_ms.saturating_sub(window_ms);
        self.log
            .iter()
            .filter(|e| e.timestamp_ms > cutoff)
            .map(|e| e.weight)
            .sum()
    }

    /// Reset wholesale when the stored window lags the clock-grid start.
    /// Burst-at-boundary is accepted, not smoothed.
    fn roll_fixed(&mut self, grid_start_ms: u64) {
        if self.window_start_ms < grid_start_ms {
            self.log.clear();
            self.total_weight = 0;
            self.window_start_ms = grid_start_ms;
        }
    }

    /// Leaky level after draining for the elapsed time, without mutating.
    fn drained_level(&self, now_ms: u64, rate_per_ms: f64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.last_leak_ms);
        (self.level - elapsed as f64 * rate_per_ms).max(0.0)
    }

    /// Drain the leaky level and pop queue entries the drained credit covers,
    /// keeping queue and level consistent.
    fn apply_leak(&mut self, now_ms: u64, rate_per_ms: f64) {
        let elapsed = now_ms.saturating_sub(self.last_leak_ms);
        let leaked = elapsed as f64 * rate_per_ms;
        self.level = (self.level - leaked).max(0.0);
        self.last_leak_ms = now_ms;

        let mut credit = leaked;
        while let Some(front) = self.log.front() {
            let weight = front.weight as f64;
            if weight <= credit {
                credit -= weight;
                self.total_weight = self.total_weight.saturating_sub(front.weight);
                self.log.pop_front();
            } else {
                break;
            }
        }
    }

    fn push_entry(&mut self, entry: LogEntry, max_log_entries: usize) {
        self.total_weight = self.total_weight.saturating_add(entry.weight);
        self.log.push_back(entry);
        // Hard cap: shed the oldest entries when the log overflows.
        while self.log.len() > max_log_entries {
            if let Some(dropped) = self.log.pop_front() {
                self.total_weight = self.total_weight.saturating_sub(dropped.weight);
            }
        }
    }
}

/// Prune a window's log per its own rule's retention, used by the governor's
/// expiry sweep.
pub(crate) fn prune_for_rule(state: &mut WindowState, rule: &Rule, now_ms: u64) {
    match rule.algorithm {
        Algorithm::SlidingWindow => state.prune_sliding(now_ms, rule.window_ms),
        Algorithm::FixedWindow => state.roll_fixed(grid_start(now_ms, rule.window_ms)),
        Algorithm::LeakyBucket => state.apply_leak(now_ms, leak_rate(rule)),
        // Token bucket state lives in the bucket store.
        Algorithm::TokenBucket => {}
    }
}

fn grid_start(now_ms: u64, window_ms: u64) -> u64 {
    (now_ms / window_ms) * window_ms
}

fn leak_rate(rule: &Rule) -> f64 {
    rule.max_operations as f64 / rule.window_ms as f64
}

fn verdict(
    rule: &Rule,
    allowed: bool,
    remaining: u64,
    reset_ms: u64,
    retry_after_ms: Option<u64>,
    metadata: Option<serde_json::Value>,
) -> Verdict {
    Verdict {
        allowed,
        remaining,
        reset_ms,
        retry_after_ms,
        rule: Some(rule.clone()),
        metadata,
    }
}

/// Per-operation window state for the three non-token algorithms.
#[derive(Debug)]
pub struct WindowStore {
    windows: DashMap<String, WindowState>,
    max_log_entries: usize,
}

impl WindowStore {
    /// Create a store with the given hard cap on log length per window.
    pub fn new(max_log_entries: usize) -> Self {
        Self {
            windows: DashMap::new(),
            max_log_entries: max_log_entries.max(1),
        }
    }

    pub(crate) fn map(&self) -> &DashMap<String, WindowState> {
        &self.windows
    }

    /// Number of resident windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether any window is resident.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop the window for one operation. Returns whether one existed.
    pub fn remove(&self, operation: &str) -> bool {
        self.windows.remove(operation).is_some()
    }

    /// Drop all windows.
    pub fn clear(&self) {
        self.windows.clear();
    }

    /// Pure evaluation: would `weight` be admitted right now?
    ///
    /// Read-only for all three window algorithms; no log is pruned and no
    /// activity timestamp moves.
    pub fn check(
        &self,
        operation: &str,
        rule: &Rule,
        weight: u64,
        now_ms: u64,
        metadata: Option<serde_json::Value>,
    ) -> Verdict {
        match rule.algorithm {
            Algorithm::SlidingWindow => {
                let current = self
                    .windows
                    .get(operation)
                    .map(|st| st.sliding_weight(now_ms, rule.window_ms))
                    .unwrap_or(0);
                let allowed = current.saturating_add(weight) <= rule.max_operations;
                // reset_ms is the full window length, not time-to-next-expiry.
                verdict(
                    rule,
                    allowed,
                    rule.max_operations.saturating_sub(current),
                    rule.window_ms,
                    None,
                    metadata,
                )
            }
            Algorithm::FixedWindow => {
                let grid = grid_start(now_ms, rule.window_ms);
                let current = self
                    .windows
                    .get(operation)
                    .filter(|st| st.window_start_ms >= grid)
                    .map(|st| st.total_weight)
                    .unwrap_or(0);
                let allowed = current.saturating_add(weight) <= rule.max_operations;
                verdict(
                    rule,
                    allowed,
                    rule.max_operations.saturating_sub(current),
                    grid + rule.window_ms - now_ms,
                    None,
                    metadata,
                )
            }
            Algorithm::LeakyBucket => {
                let rate = leak_rate(rule);
                let level = self
                    .windows
                    .get(operation)
                    .map(|st| st.drained_level(now_ms, rate))
                    .unwrap_or(0.0);
                leaky_verdict(rule, level, weight, rate, metadata)
            }
            // Dispatched to the token bucket store by the engine.
            Algorithm::TokenBucket => Verdict::unthrottled(metadata),
        }
    }

    /// Check and, if allowed, commit under a single entry guard.
    ///
    /// Returns the verdict (with post-commit remaining capacity) and the
    /// in-window weight after the call.
    pub fn admit(
        &self,
        operation: &str,
        rule: &Rule,
        weight: u64,
        now_ms: u64,
        metadata: Option<serde_json::Value>,
    ) -> (Verdict, u64) {
        let mut state = self
            .windows
            .entry(operation.to_string())
            .or_insert_with(|| WindowState::new(now_ms));
        state.last_activity_ms = now_ms;

        let result = match rule.algorithm {
            Algorithm::SlidingWindow => {
                state.prune_sliding(now_ms, rule.window_ms);
                let allowed = state.total_weight.saturating_add(weight) <= rule.max_operations;
                if allowed {
                    state.push_entry(
                        LogEntry {
                            timestamp_ms: now_ms,
                            weight,
                            metadata: metadata.clone(),
                        },
                        self.max_log_entries,
                    );
                }
                verdict(
                    rule,
                    allowed,
                    rule.max_operations.saturating_sub(state.total_weight),
                    rule.window_ms,
                    None,
                    metadata,
                )
            }
            Algorithm::FixedWindow => {
                let grid = grid_start(now_ms, rule.window_ms);
                state.roll_fixed(grid);
                let allowed = state.total_weight.saturating_add(weight) <= rule.max_operations;
                if allowed {
                    state.push_entry(
                        LogEntry {
                            timestamp_ms: now_ms,
                            weight,
                            metadata: metadata.clone(),
                        },
                        self.max_log_entries,
                    );
                }
                verdict(
                    rule,
                    allowed,
                    rule.max_operations.saturating_sub(state.total_weight),
                    grid + rule.window_ms - now_ms,
                    None,
                    metadata,
                )
            }
            Algorithm::LeakyBucket => {
                let rate = leak_rate(rule);
                state.apply_leak(now_ms, rate);
                let v = leaky_verdict(rule, state.level, weight, rate, metadata.clone());
                if v.allowed {
                    state.level += weight as f64;
                    state.push_entry(
                        LogEntry {
                            timestamp_ms: now_ms,
                            weight,
                            metadata,
                        },
                        self.max_log_entries,
                    );
                    verdict(
                        rule,
                        true,
                        (rule.max_operations as f64 - state.level).max(0.0).floor() as u64,
                        rule.window_ms,
                        None,
                        v.metadata,
                    )
                } else {
                    v
                }
            }
            Algorithm::TokenBucket => Verdict::unthrottled(metadata),
        };

        if !result.allowed {
            trace!(operation = %operation, weight = weight, "Admission denied");
        }

        let total = state.total_weight;
        (result, total)
    }

    /// Commit a usage event without re-validation, trusting that the caller
    /// previously checked it. Returns the in-window weight after the commit.
    pub fn commit(
        &self,
        operation: &str,
        rule: &Rule,
        weight: u64,
        now_ms: u64,
        metadata: Option<serde_json::Value>,
    ) -> u64 {
        let mut state = self
            .windows
            .entry(operation.to_string())
            .or_insert_with(|| WindowState::new(now_ms));
        state.last_activity_ms = now_ms;

        match rule.algorithm {
            Algorithm::SlidingWindow => state.prune_sliding(now_ms, rule.window_ms),
            Algorithm::FixedWindow => state.roll_fixed(grid_start(now_ms, rule.window_ms)),
            Algorithm::LeakyBucket => {
                state.apply_leak(now_ms, leak_rate(rule));
                state.level += weight as f64;
            }
            Algorithm::TokenBucket => return state.total_weight,
        }

        state.push_entry(
            LogEntry {
                timestamp_ms: now_ms,
                weight,
                metadata,
            },
            self.max_log_entries,
        );
        state.total_weight
    }
}

fn leaky_verdict(
    rule: &Rule,
    level: f64,
    weight: u64,
    rate_per_ms: f64,
    metadata: Option<serde_json::Value>,
) -> Verdict {
    let max = rule.max_operations as f64;
    let allowed = level + weight as f64 <= max;
    let retry_after_ms = if allowed {
        None
    } else {
        Some(((level + weight as f64 - max) / rate_per_ms).ceil() as u64)
    };
    verdict(
        rule,
        allowed,
        (max - level).max(0.0).floor() as u64,
        rule.window_ms,
        retry_after_ms,
        metadata,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sliding_rule() -> Rule {
        Rule::new("op", 5, 1_000, Algorithm::SlidingWindow)
    }

    #[test]
    fn test_sliding_window_denies_sixth_then_recovers() {
        let store = WindowStore::new(10_000);
        let rule = sliding_rule();

        for _ in 0..5 {
            let (v, _) = store.admit("op", &rule, 1, 0, None);
            assert!(v.allowed);
        }
        let (v, _) = store.admit("op", &rule, 1, 0, None);
        assert!(!v.allowed);
        assert_eq!(v.remaining, 0);
        assert_eq!(v.reset_ms, 1_000);

        // Once the early entries age past the window, admission resumes.
        let (v, _) = store.admit("op", &rule, 1, 1_001, None);
        assert!(v.allowed);
    }

    #[test]
    fn test_sliding_check_is_read_only() {
        let store = WindowStore::new(10_000);
        let rule = sliding_rule();

        store.admit("op", &rule, 3, 0, None);
        let before = store.map().get("op").unwrap().log.len();

        let v = store.check("op", &rule, 1, 2_000, None);
        assert!(v.allowed);
        // Aged entries are excluded from the computation but not pruned.
        assert_eq!(store.map().get("op").unwrap().log.len(), before);
        assert_eq!(v.remaining, 5);
    }

    #[test]
    fn test_sliding_cached_weight_matches_log() {
        let store = WindowStore::new(10_000);
        let rule = sliding_rule();

        store.admit("op", &rule, 2, 0, None);
        store.admit("op", &rule, 2, 500, None);
        store.admit("op", &rule, 1, 1_200, None);

        let st = store.map().get("op").unwrap();
        let sum: u64 = st.log.iter().map(|e| e.weight).sum();
        assert_eq!(st.total_weight, sum);
    }

    #[test]
    fn test_fixed_window_resets_on_grid_boundary() {
        let store = WindowStore::new(10_000);
        let rule = Rule::new("op", 3, 1_000, Algorithm::FixedWindow);

        for t in [0, 400, 999] {
            let (v, _) = store.admit("op", &rule, 1, t, None);
            assert!(v.allowed);
        }
        let (v, _) = store.admit("op", &rule, 1, 999, None);
        assert!(!v.allowed);

        // 1 ms into the next grid window the counter resets wholesale.
        let (v, _) = store.admit("op", &rule, 1, 1_000, None);
        assert!(v.allowed);
        assert_eq!(v.remaining, 2);
    }

    #[test]
    fn test_fixed_window_reset_time_is_exact() {
        let store = WindowStore::new(10_000);
        let rule = Rule::new("op", 3, 1_000, Algorithm::FixedWindow);

        let v = store.check("op", &rule, 1, 250, None);
        assert_eq!(v.reset_ms, 750);
    }

    #[test]
    fn test_leaky_bucket_drains_over_time() {
        let store = WindowStore::new(10_000);
        let rule = Rule::new("op", 4, 1_000, Algorithm::LeakyBucket);

        for _ in 0..4 {
            let (v, _) = store.admit("op", &rule, 1, 0, None);
            assert!(v.allowed);
        }
        let (v, _) = store.admit("op", &rule, 1, 0, None);
        assert!(!v.allowed);
        // Need one unit to drain at 4 units / 1000 ms.
        assert_eq!(v.retry_after_ms, Some(250));

        let (v, _) = store.admit("op", &rule, 1, 250, None);
        assert!(v.allowed);
    }

    #[test]
    fn test_leaky_queue_tracks_level() {
        let store = WindowStore::new(10_000);
        let rule = Rule::new("op", 4, 1_000, Algorithm::LeakyBucket);

        store.admit("op", &rule, 2, 0, None);
        store.admit("op", &rule, 2, 0, None);

        // After 500 ms, two units have leaked: one whole entry popped.
        store.admit("op", &rule, 1, 500, None);
        let st = store.map().get("op").unwrap();
        assert_eq!(st.log.len(), 2);
        assert!((st.level - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_leaky_queue_appended_only_on_commit() {
        let store = WindowStore::new(10_000);
        let rule = Rule::new("op", 4, 1_000, Algorithm::LeakyBucket);

        let v = store.check("op", &rule, 1, 0, None);
        assert!(v.allowed);
        assert!(store.map().get("op").is_none());
    }

    #[test]
    fn test_log_hard_cap_sheds_oldest() {
        let store = WindowStore::new(3);
        let rule = Rule::new("op", 1_000, 60_000, Algorithm::SlidingWindow);

        for t in 0..5u64 {
            store.commit("op", &rule, 1, t, None);
        }
        let st = store.map().get("op").unwrap();
        assert_eq!(st.log.len(), 3);
        assert_eq!(st.total_weight, 3);
        assert_eq!(st.log.front().unwrap().timestamp_ms, 2);
    }

    #[test]
    fn test_commit_trusts_caller_past_limit() {
        let store = WindowStore::new(10_000);
        let rule = sliding_rule();

        // recordUsage-style commits are not re-validated.
        for _ in 0..8 {
            store.commit("op", &rule, 1, 0, None);
        }
        assert_eq!(store.map().get("op").unwrap().total_weight, 8);
    }

    #[test]
    fn test_weighted_admission() {
        let store = WindowStore::new(10_000);
        let rule = sliding_rule();

        let (v, _) = store.admit("op", &rule, 4, 0, None);
        assert!(v.allowed);
        assert_eq!(v.remaining, 1);

        let (v, _) = store.admit("op", &rule, 2, 0, None);
        assert!(!v.allowed);

        let (v, _) = store.admit("op", &rule, 1, 0, None);
        assert!(v.allowed);
        assert_eq!(v.remaining, 0);
    }
}
