//! Configuration for the Turnstile engine.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::admission::rule::{Algorithm, Rule};
use crate::error::{EngineError, Result};

/// Main configuration for the admission engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Memory governor tuning
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Admission rules installed at startup
    #[serde(default = "default_rules")]
    pub rules: Vec<Rule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            governor: GovernorConfig::default(),
            rules: default_rules(),
        }
    }
}

/// Memory governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Base sweep period in milliseconds; shrinks as windows accumulate.
    #[serde(default = "default_base_period_ms")]
    pub base_period_ms: u64,

    /// Lower bound on the sweep period in milliseconds.
    #[serde(default = "default_min_period_ms")]
    pub min_period_ms: u64,

    /// Windows and buckets idle longer than this are deleted.
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,

    /// Estimated footprint above which the governor starts evicting.
    #[serde(default = "default_warn_bytes")]
    pub warn_bytes: usize,

    /// Hard footprint limit; overshooting it raises the eviction fraction.
    #[serde(default = "default_hard_bytes")]
    pub hard_bytes: usize,

    /// Maximum distinct windows retained per normalized base pattern.
    #[serde(default = "default_per_pattern_cap")]
    pub per_pattern_cap: usize,

    /// Hard cap on log entries per window.
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,

    /// Maximum distinct operations retained in per-operation statistics.
    #[serde(default = "default_max_tracked_operations")]
    pub max_tracked_operations: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            base_period_ms: default_base_period_ms(),
            min_period_ms: default_min_period_ms(),
            idle_ms: default_idle_ms(),
            warn_bytes: default_warn_bytes(),
            hard_bytes: default_hard_bytes(),
            per_pattern_cap: default_per_pattern_cap(),
            max_log_entries: default_max_log_entries(),
            max_tracked_operations: default_max_tracked_operations(),
        }
    }
}

fn default_base_period_ms() -> u64 {
    30_000
}

fn default_min_period_ms() -> u64 {
    1_000
}

fn default_idle_ms() -> u64 {
    300_000
}

fn default_warn_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_hard_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_per_pattern_cap() -> usize {
    32
}

fn default_max_log_entries() -> usize {
    10_000
}

fn default_max_tracked_operations() -> usize {
    1_024
}

/// Startup rules: a catch-all plus four category rules encoding relative
/// operation cost for the automation tool's expensive operation classes.
fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new("*", 100, 60_000, Algorithm::SlidingWindow),
        Rule::new("screenshot.*", 10, 60_000, Algorithm::TokenBucket).with_burst(15),
        Rule::new("dom.*", 20, 60_000, Algorithm::SlidingWindow),
        Rule::new("automation.*", 30, 60_000, Algorithm::LeakyBucket),
        Rule::new("file.*", 5, 60_000, Algorithm::FixedWindow),
    ]
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading engine configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| EngineError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_cover_operation_classes() {
        let config = EngineConfig::default();
        assert_eq!(config.rules.len(), 5);

        let catch_all = config.rules.iter().find(|r| r.pattern == "*").unwrap();
        assert_eq!(catch_all.max_operations, 100);
        assert_eq!(catch_all.algorithm, Algorithm::SlidingWindow);

        let screenshot = config
            .rules
            .iter()
            .find(|r| r.pattern == "screenshot.*")
            .unwrap();
        assert_eq!(screenshot.algorithm, Algorithm::TokenBucket);
        assert_eq!(screenshot.burst_size, Some(15));

        for rule in &config.rules {
            assert!(rule.validate().is_ok());
        }
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
governor:
  idle_ms: 60000
  per_pattern_cap: 8
rules:
  - pattern: "screenshot.*"
    max_operations: 5
    window_ms: 30000
    algorithm: token_bucket
    burst_size: 8
  - pattern: "*"
    max_operations: 50
    window_ms: 60000
    algorithm: sliding_window
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.governor.idle_ms, 60_000);
        assert_eq!(config.governor.per_pattern_cap, 8);
        // Unset governor fields fall back to defaults.
        assert_eq!(config.governor.base_period_ms, 30_000);

        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].algorithm, Algorithm::TokenBucket);
        assert_eq!(config.rules[0].burst_size, Some(8));
    }

    #[test]
    fn test_parse_invalid_yaml_fails() {
        assert!(EngineConfig::from_yaml("rules: {not: [valid").is_err());
    }
}
