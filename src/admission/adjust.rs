//! Temporary, self-reverting capacity adjustments.
//!
//! An adjustment swaps the resolved rule for a scaled copy and schedules one
//! deferred reversion. Reversion is fire-and-forget: by the time it fires the
//! rule may have been removed or replaced, so reinstallation is a best-effort
//! upsert, never an assertion. Concurrent adjustments on the same operation
//! are deliberately not coalesced; each one reverts independently.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use super::rule::{Rule, RuleRegistry};

/// Installs temporary capacity multipliers on resolved rules.
#[derive(Debug)]
pub struct TemporaryAdjuster {
    registry: Arc<RuleRegistry>,
    reversions: Mutex<Vec<JoinHandle<()>>>,
}

impl TemporaryAdjuster {
    /// Create an adjuster over the shared registry.
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self {
            registry,
            reversions: Mutex::new(Vec::new()),
        }
    }

    /// Scale the rule resolved for `operation` by `multiplier` for `duration`.
    ///
    /// The scaled limit is floored with a minimum of 1; the burst size is
    /// rescaled and kept at or above the new limit. Returns `false` without
    /// installing anything when no rule resolves (fail-open operations have
    /// nothing to adjust).
    pub fn adjust(&self, operation: &str, multiplier: f64, duration: Duration) -> bool {
        let Some(original) = self.registry.resolve(operation) else {
            trace!(operation = %operation, "No rule resolves; nothing to adjust");
            return false;
        };

        let factor = if multiplier.is_finite() { multiplier.max(0.0) } else { 1.0 };
        let scaled_max = ((original.max_operations as f64 * factor).floor() as u64).max(1);
        let scaled_burst = original
            .burst_size
            .map(|b| (((b as f64 * factor).floor() as u64).max(scaled_max)));

        let adjusted = Rule {
            max_operations: scaled_max,
            burst_size: scaled_burst,
            rule_id: Some(format!("adjusted-{}", Uuid::new_v4())),
            ..original.clone()
        };

        debug!(
            operation = %operation,
            pattern = %original.pattern,
            max_operations = scaled_max,
            duration_ms = duration.as_millis() as u64,
            "Installing temporary rule adjustment"
        );
        self.registry.insert(adjusted);

        let registry = Arc::clone(&self.registry);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            debug!(pattern = %original.pattern, "Reverting temporary rule adjustment");
            registry.insert(original);
        });

        let mut reversions = self.reversions.lock();
        reversions.retain(|h| !h.is_finished());
        reversions.push(handle);
        true
    }

    /// Number of reversions still pending.
    pub fn pending(&self) -> usize {
        let mut reversions = self.reversions.lock();
        reversions.retain(|h| !h.is_finished());
        reversions.len()
    }

    /// Cancel all pending reversions (process shutdown).
    pub fn shutdown(&self) {
        let mut reversions = self.reversions.lock();
        for handle in reversions.drain(..) {
            handle.abort();
        }
    }
}
