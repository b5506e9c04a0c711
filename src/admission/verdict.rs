//! Admission verdicts returned to callers.

use serde::Serialize;

use super::rule::Rule;

/// Remaining capacity reported for unthrottled operations.
pub const UNLIMITED: u64 = u64::MAX;

/// The outcome of an admission check.
///
/// Transient value, never stored by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    /// Whether the operation may run.
    pub allowed: bool,
    /// Remaining admissible weight. [`UNLIMITED`] when no rule applies.
    pub remaining: u64,
    /// Milliseconds until capacity resets. For sliding windows this is
    /// reported as the full window length, an intentional approximation.
    pub reset_ms: u64,
    /// Suggested wait before retrying a denied operation, where the
    /// algorithm can compute one (token bucket, leaky bucket).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// The rule that produced this verdict, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<Rule>,
    /// Caller-supplied metadata, echoed back for diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Verdict {
    /// Verdict for an operation with no resolvable rule: always allowed.
    pub fn unthrottled(metadata: Option<serde_json::Value>) -> Self {
        Self {
            allowed: true,
            remaining: UNLIMITED,
            reset_ms: 0,
            retry_after_ms: None,
            rule: None,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unthrottled_verdict() {
        let verdict = Verdict::unthrottled(None);
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, UNLIMITED);
        assert_eq!(verdict.reset_ms, 0);
        assert!(verdict.rule.is_none());
    }

    #[test]
    fn test_metadata_echo() {
        let meta = serde_json::json!({"tab": 3});
        let verdict = Verdict::unthrottled(Some(meta.clone()));
        assert_eq!(verdict.metadata, Some(meta));
    }
}
