//! Memory governor: recurring expiry sweeps, budget enforcement, and
//! per-pattern caps on resident window state.
//!
//! The governor runs on its own schedule, independent of request-path calls.
//! Sweeps touch one key at a time through the store's sharded maps, so
//! admission checks are never blocked behind a full sweep. The footprint
//! estimate is a heuristic: inaccuracy causes over- or under-eviction, never
//! an error, and a slow sweep never cancels future sweeps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GovernorConfig;

use super::bucket::TokenBucketStore;
use super::clock::Clock;
use super::rule::{Algorithm, RuleRegistry};
use super::stats::StatisticsCollector;
use super::window::{self, WindowStore};

/// Fixed unit costs for the footprint estimate.
const RULE_COST: usize = 256;
const WINDOW_COST: usize = 512;
const ENTRY_COST: usize = 64;
const BUCKET_COST: usize = 128;
/// Safety margin applied to the raw estimate.
const ESTIMATE_MARGIN: f64 = 1.2;

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});
static EPOCH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{10,13}").unwrap());
static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{3,}").unwrap());

/// Fold variable substrings of a concrete operation name into placeholders.
///
/// Heuristics apply in a fixed order so grouping is deterministic: UUIDs,
/// then epoch-length digit runs, then any remaining digit runs of three or
/// more.
pub(crate) fn base_pattern(name: &str) -> String {
    let folded = UUID_RE.replace_all(name, "{uuid}");
    let folded = EPOCH_RE.replace_all(&folded, "{ts}");
    ID_RE.replace_all(&folded, "{id}").into_owned()
}

/// Handle to a running governor schedule.
#[derive(Debug)]
pub struct GovernorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GovernorHandle {
    /// Signal the schedule to stop after the current iteration.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Prunes expired and idle state, enforces the memory budget, and caps
/// windows per base pattern.
pub struct MemoryGovernor {
    registry: Arc<RuleRegistry>,
    windows: Arc<WindowStore>,
    buckets: Arc<TokenBucketStore>,
    stats: Arc<StatisticsCollector>,
    clock: Arc<dyn Clock>,
    config: GovernorConfig,
}

impl MemoryGovernor {
    /// Create a governor over the engine's shared stores.
    pub fn new(
        registry: Arc<RuleRegistry>,
        windows: Arc<WindowStore>,
        buckets: Arc<TokenBucketStore>,
        stats: Arc<StatisticsCollector>,
        clock: Arc<dyn Clock>,
        config: GovernorConfig,
    ) -> Self {
        Self {
            registry,
            windows,
            buckets,
            stats,
            clock,
            config,
        }
    }

    /// Current sweep period: shrinks as windows accumulate, floored at the
    /// configured minimum.
    pub fn period(&self) -> Duration {
        let windows = self.windows.len() as u64;
        let period_ms = (self.config.base_period_ms / (1 + windows / 64))
            .max(self.config.min_period_ms);
        Duration::from_millis(period_ms)
    }

    /// Run one full sweep. Returns the number of windows and buckets removed.
    pub fn sweep(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let mut removed = self.expiry_sweep(now_ms);
        removed += self.enforce_budget();
        removed += self.enforce_pattern_caps();
        if removed > 0 {
            debug!(removed = removed, "Governor sweep removed state");
        }
        removed
    }

    /// Estimate the resident footprint in bytes from fixed unit costs plus
    /// serialized metadata sizes, with a safety margin.
    pub fn estimate_memory(&self) -> usize {
        let mut total = self.registry.len() * RULE_COST + self.buckets.len() * BUCKET_COST;
        for entry in self.windows.map().iter() {
            total += WINDOW_COST;
            for log_entry in entry.log.iter() {
                total += ENTRY_COST;
                if let Some(metadata) = &log_entry.metadata {
                    total += serde_json::to_string(metadata).map(|s| s.len()).unwrap_or(0);
                }
            }
        }
        (total as f64 * ESTIMATE_MARGIN) as usize
    }

    /// Pass 1: prune expired entries, drop idle windows, buckets, and
    /// per-operation statistics counters, drop state whose rule no longer
    /// exists or no longer uses that store.
    fn expiry_sweep(&self, now_ms: u64) -> usize {
        let mut removed = 0;

        self.windows.map().retain(|name, state| {
            let Some(rule) = self.registry.resolve(name) else {
                removed += 1;
                return false;
            };
            if rule.algorithm == Algorithm::TokenBucket {
                // The rule moved to the bucket store; this window is stale.
                removed += 1;
                return false;
            }
            window::prune_for_rule(state, &rule, now_ms);
            if now_ms.saturating_sub(state.last_activity_ms) > self.config.idle_ms {
                removed += 1;
                false
            } else {
                true
            }
        });

        self.buckets.map().retain(|name, state| {
            match self.registry.resolve(name) {
                Some(rule) if rule.algorithm == Algorithm::TokenBucket => {
                    if now_ms.saturating_sub(state.last_activity_ms) > self.config.idle_ms {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                }
                _ => {
                    removed += 1;
                    false
                }
            }
        });

        removed += self.stats.evict_stale(
            now_ms,
            self.config.idle_ms,
            self.config.max_tracked_operations,
        );

        removed
    }

    /// Pass 2: above the warning threshold, evict a fraction of windows
    /// chosen oldest-and-largest first.
    fn enforce_budget(&self) -> usize {
        let estimate = self.estimate_memory();
        if estimate <= self.config.warn_bytes {
            return 0;
        }

        let fraction = if estimate >= self.config.hard_bytes.saturating_mul(2) {
            0.5
        } else if estimate >= self.config.hard_bytes {
            0.3
        } else {
            0.2
        };

        // Composite score: a resident log entry ages a window by one second.
        let mut candidates: Vec<(String, u64)> = self
            .windows
            .map()
            .iter()
            .map(|entry| {
                let score = entry
                    .last_activity_ms
                    .saturating_sub(entry.log.len() as u64 * 1_000);
                (entry.key().clone(), score)
            })
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1));

        let evict = ((candidates.len() as f64 * fraction).ceil() as usize).min(candidates.len());
        let mut removed = 0;
        for (name, _) in candidates.into_iter().take(evict) {
            if self.windows.remove(&name) {
                removed += 1;
            }
        }

        warn!(
            estimate_bytes = estimate,
            warn_bytes = self.config.warn_bytes,
            evicted = removed,
            "Memory budget exceeded, evicted windows"
        );
        removed
    }

    /// Pass 3: cap distinct windows per normalized base pattern, evicting
    /// least-recently-active excess first.
    fn enforce_pattern_caps(&self) -> usize {
        let cap = self.config.per_pattern_cap;
        if cap == 0 {
            return 0;
        }

        let mut groups: HashMap<String, Vec<(String, u64)>> = HashMap::new();
        for entry in self.windows.map().iter() {
            groups
                .entry(base_pattern(entry.key()))
                .or_default()
                .push((entry.key().clone(), entry.last_activity_ms));
        }

        let mut removed = 0;
        for (base, mut members) in groups {
            if members.len() <= cap {
                continue;
            }
            members.sort_by(|a, b| b.1.cmp(&a.1));
            let excess = members.len() - cap;
            for (name, _) in members.into_iter().skip(cap) {
                if self.windows.remove(&name) {
                    removed += 1;
                }
            }
            debug!(
                base_pattern = %base,
                evicted = excess,
                cap = cap,
                "Capped windows for base pattern"
            );
        }
        removed
    }

    /// Start the recurring sweep schedule.
    pub fn spawn(self: Arc<Self>) -> GovernorHandle {
        let (tx, mut rx) = watch::channel(false);
        let governor = self;
        let task = tokio::spawn(async move {
            info!("Memory governor started");
            loop {
                let period = governor.period();
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        governor.sweep();
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Memory governor stopped");
        });
        GovernorHandle { shutdown: tx, task }
    }
}
