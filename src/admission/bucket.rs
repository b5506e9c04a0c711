//! Token bucket state and algorithm.
//!
//! Unlike the window-based algorithms, a token bucket check that admits the
//! operation deducts the weight immediately, inside the same entry guard.
//! Two concurrent checks must not both observe sufficient tokens before
//! either commits, or capacity is over-admitted; the deduct-at-check rule is
//! a correctness requirement, not a convenience.

use dashmap::DashMap;
use tracing::trace;

use super::rule::Rule;
use super::verdict::Verdict;

/// Mutable token bucket state for one concrete operation name.
#[derive(Debug)]
pub struct TokenBucketState {
    /// Tokens currently available. Never negative after an admission, never
    /// above the rule's capacity.
    pub tokens: f64,
    /// Last time tokens were refilled.
    pub last_refill_ms: u64,
    /// Last check or record that touched this bucket.
    pub last_activity_ms: u64,
}

/// Per-operation token bucket state, created lazily on first use.
#[derive(Debug, Default)]
pub struct TokenBucketStore {
    buckets: DashMap<String, TokenBucketState>,
}

impl TokenBucketStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn map(&self) -> &DashMap<String, TokenBucketState> {
        &self.buckets
    }

    /// Number of resident buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether any bucket is resident.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop the bucket for one operation. Returns whether one existed.
    pub fn remove(&self, operation: &str) -> bool {
        self.buckets.remove(operation).is_some()
    }

    /// Drop all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Refill, then admit and deduct in one step.
    ///
    /// The bucket starts full at the rule's capacity (`burst_size` when set).
    pub fn try_acquire(
        &self,
        operation: &str,
        rule: &Rule,
        weight: u64,
        now_ms: u64,
        metadata: Option<serde_json::Value>,
    ) -> Verdict {
        let capacity = rule.capacity() as f64;
        let rate_per_ms = rule.max_operations as f64 / rule.window_ms as f64;

        let mut state = self
            .buckets
            .entry(operation.to_string())
            .or_insert_with(|| TokenBucketState {
                tokens: capacity,
                last_refill_ms: now_ms,
                last_activity_ms: now_ms,
            });

        let elapsed = now_ms.saturating_sub(state.last_refill_ms);
        state.tokens = (state.tokens + elapsed as f64 * rate_per_ms).min(capacity);
        state.last_refill_ms = now_ms;
        state.last_activity_ms = now_ms;

        let needed = weight as f64;
        if state.tokens >= needed {
            state.tokens -= needed;
            Verdict {
                allowed: true,
                remaining: state.tokens.floor() as u64,
                reset_ms: time_to_full(capacity, state.tokens, rate_per_ms),
                retry_after_ms: None,
                rule: Some(rule.clone()),
                metadata,
            }
        } else {
            let retry_after_ms = ((needed - state.tokens) / rate_per_ms).ceil() as u64;
            trace!(
                operation = %operation,
                weight = weight,
                retry_after_ms = retry_after_ms,
                "Token bucket denied"
            );
            Verdict {
                allowed: false,
                remaining: state.tokens.floor() as u64,
                reset_ms: time_to_full(capacity, state.tokens, rate_per_ms),
                retry_after_ms: Some(retry_after_ms),
                rule: Some(rule.clone()),
                metadata,
            }
        }
    }

    /// Deduct a usage event without re-validation, clamping at empty.
    ///
    /// Used by `recordUsage`, which trusts that the caller previously checked.
    pub fn deduct(&self, operation: &str, rule: &Rule, weight: u64, now_ms: u64) {
        let capacity = rule.capacity() as f64;
        let rate_per_ms = rule.max_operations as f64 / rule.window_ms as f64;

        let mut state = self
            .buckets
            .entry(operation.to_string())
            .or_insert_with(|| TokenBucketState {
                tokens: capacity,
                last_refill_ms: now_ms,
                last_activity_ms: now_ms,
            });

        let elapsed = now_ms.saturating_sub(state.last_refill_ms);
        state.tokens = (state.tokens + elapsed as f64 * rate_per_ms).min(capacity);
        state.last_refill_ms = now_ms;
        state.last_activity_ms = now_ms;
        state.tokens = (state.tokens - weight as f64).max(0.0);
    }
}

fn time_to_full(capacity: f64, tokens: f64, rate_per_ms: f64) -> u64 {
    ((capacity - tokens) / rate_per_ms).ceil() as u64
}
