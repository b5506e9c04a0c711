//! Admission control: rules, algorithms, statistics, and memory governance.

pub mod adjust;
pub mod bucket;
pub mod clock;
pub mod engine;
pub mod governor;
pub mod rule;
pub mod stats;
pub mod verdict;
pub mod window;

pub use adjust::TemporaryAdjuster;
pub use bucket::TokenBucketStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::AdmissionEngine;
pub use governor::{GovernorHandle, MemoryGovernor};
pub use rule::{Algorithm, Rule, RuleRegistry};
pub use stats::{OperationStats, StatisticsCollector, StatsSnapshot};
pub use verdict::{Verdict, UNLIMITED};
pub use window::WindowStore;
