//! Global and per-operation admission statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Default)]
struct OpCounters {
    checked: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    total_weight: AtomicU64,
    last_seen_ms: AtomicU64,
}

/// Aggregates admission outcomes.
///
/// Counters increase monotonically except on explicit reset. All updates are
/// atomic; no lock is held on the request path.
#[derive(Debug, Default)]
pub struct StatisticsCollector {
    checked: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    /// High-water mark of in-window weight observed after any commit.
    peak_window_weight: AtomicU64,
    /// When counting started, for ops/sec derivation.
    started_ms: AtomicU64,
    per_operation: DashMap<String, OpCounters>,
}

/// Per-operation counters in a statistics snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OperationStats {
    pub checked: u64,
    pub allowed: u64,
    pub denied: u64,
    /// Accumulated weight of allowed operations.
    pub total_weight: u64,
}

/// A point-in-time statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub checked: u64,
    pub allowed: u64,
    pub denied: u64,
    /// Checks per second since the collector started (or was reset).
    pub ops_per_sec: f64,
    /// Highest in-window weight observed for any single operation.
    pub peak_window_weight: u64,
    /// The governor's current memory footprint estimate, in bytes.
    pub memory_estimate_bytes: usize,
    pub per_operation: HashMap<String, OperationStats>,
}

impl StatisticsCollector {
    /// Create a collector that starts counting at `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        let collector = Self::default();
        collector.started_ms.store(now_ms, Ordering::Relaxed);
        collector
    }

    /// Record one check outcome. Weight accumulates only when allowed.
    pub fn record(&self, operation: &str, weight: u64, allowed: bool, now_ms: u64) {
        self.checked.fetch_add(1, Ordering::Relaxed);
        let op = self.per_operation.entry(operation.to_string()).or_default();
        op.last_seen_ms.store(now_ms, Ordering::Relaxed);
        op.checked.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            op.allowed.fetch_add(1, Ordering::Relaxed);
            op.total_weight.fetch_add(weight, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            op.denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Raise the peak in-window weight high-water mark.
    pub fn observe_window_weight(&self, total_weight: u64) {
        self.peak_window_weight
            .fetch_max(total_weight, Ordering::Relaxed);
    }

    /// Snapshot current counters plus derived values.
    pub fn snapshot(&self, now_ms: u64, memory_estimate_bytes: usize) -> StatsSnapshot {
        let checked = self.checked.load(Ordering::Relaxed);
        let elapsed_ms = now_ms.saturating_sub(self.started_ms.load(Ordering::Relaxed));
        let ops_per_sec = if elapsed_ms == 0 {
            0.0
        } else {
            checked as f64 * 1_000.0 / elapsed_ms as f64
        };

        StatsSnapshot {
            checked,
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            ops_per_sec,
            peak_window_weight: self.peak_window_weight.load(Ordering::Relaxed),
            memory_estimate_bytes,
            per_operation: self
                .per_operation
                .iter()
                .map(|entry| {
                    (
                        entry.key().clone(),
                        OperationStats {
                            checked: entry.checked.load(Ordering::Relaxed),
                            allowed: entry.allowed.load(Ordering::Relaxed),
                            denied: entry.denied.load(Ordering::Relaxed),
                            total_weight: entry.total_weight.load(Ordering::Relaxed),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Zero all counters and restart the ops/sec clock at `now_ms`.
    pub fn reset(&self, now_ms: u64) {
        self.checked.store(0, Ordering::Relaxed);
        self.allowed.store(0, Ordering::Relaxed);
        self.denied.store(0, Ordering::Relaxed);
        self.peak_window_weight.store(0, Ordering::Relaxed);
        self.started_ms.store(now_ms, Ordering::Relaxed);
        self.per_operation.clear();
    }

    /// Drop the counters for one operation (single-operation reset).
    pub fn remove_operation(&self, operation: &str) {
        self.per_operation.remove(operation);
    }

    /// Drop per-operation counters idle longer than `idle_ms` and cap the map
    /// at `max_entries`, keeping the most recently seen. Returns the number
    /// removed. Global totals are untouched, so engine-wide counts stay
    /// monotonic between resets.
    pub fn evict_stale(&self, now_ms: u64, idle_ms: u64, max_entries: usize) -> usize {
        let mut removed = 0;
        self.per_operation.retain(|_, op| {
            if now_ms.saturating_sub(op.last_seen_ms.load(Ordering::Relaxed)) > idle_ms {
                removed += 1;
                false
            } else {
                true
            }
        });

        if self.per_operation.len() > max_entries {
            let mut entries: Vec<(String, u64)> = self
                .per_operation
                .iter()
                .map(|entry| {
                    (
                        entry.key().clone(),
                        entry.last_seen_ms.load(Ordering::Relaxed),
                    )
                })
                .collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            for (operation, _) in entries.into_iter().skip(max_entries) {
                if self.per_operation.remove(&operation).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_outcomes() {
        let stats = StatisticsCollector::new(0);
        stats.record("screenshot.viewport", 2, true, 0);
        stats.record("screenshot.viewport", 2, false, 0);
        stats.record("dom.snapshot", 1, true, 0);

        let snap = stats.snapshot(1_000, 0);
        assert_eq!(snap.checked, 3);
        assert_eq!(snap.allowed, 2);
        assert_eq!(snap.denied, 1);

        let op = &snap.per_operation["screenshot.viewport"];
        assert_eq!(op.checked, 2);
        assert_eq!(op.allowed, 1);
        assert_eq!(op.denied, 1);
        // Denied weight does not accumulate.
        assert_eq!(op.total_weight, 2);
    }

    #[test]
    fn test_ops_per_sec_derivation() {
        let stats = StatisticsCollector::new(0);
        for _ in 0..10 {
            stats.record("op", 1, true, 0);
        }
        let snap = stats.snapshot(2_000, 0);
        assert!((snap.ops_per_sec - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_peak_window_weight_high_water() {
        let stats = StatisticsCollector::new(0);
        stats.observe_window_weight(3);
        stats.observe_window_weight(9);
        stats.observe_window_weight(4);
        assert_eq!(stats.snapshot(0, 0).peak_window_weight, 9);
    }

    #[test]
    fn test_reset_clears_everything() {
        let stats = StatisticsCollector::new(0);
        stats.record("op", 1, true, 0);
        stats.observe_window_weight(5);

        stats.reset(10_000);
        let snap = stats.snapshot(11_000, 0);
        assert_eq!(snap.checked, 0);
        assert_eq!(snap.peak_window_weight, 0);
        assert!(snap.per_operation.is_empty());
    }

    #[test]
    fn test_evict_stale_drops_idle_counters() {
        let stats = StatisticsCollector::new(0);
        stats.record("old.op", 1, true, 0);
        stats.record("new.op", 1, true, 500_000);

        let removed = stats.evict_stale(500_000, 300_000, 100);
        assert_eq!(removed, 1);

        let snap = stats.snapshot(500_000, 0);
        assert!(!snap.per_operation.contains_key("old.op"));
        assert!(snap.per_operation.contains_key("new.op"));
        // Global totals survive per-operation eviction.
        assert_eq!(snap.checked, 2);
    }

    #[test]
    fn test_evict_stale_caps_map_keeping_most_recent() {
        let stats = StatisticsCollector::new(0);
        for i in 0..10u64 {
            stats.record(&format!("op.{}", i), 1, true, i);
        }

        stats.evict_stale(10, 1_000_000, 4);
        let snap = stats.snapshot(10, 0);
        assert_eq!(snap.per_operation.len(), 4);
        assert!(snap.per_operation.contains_key("op.9"));
        assert!(!snap.per_operation.contains_key("op.0"));
    }
}
