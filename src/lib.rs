//! Turnstile — Admission Control for Browser Automation Tooling
//!
//! This crate implements the admission-control engine that gates how often
//! categories of expensive operations (screenshots, DOM snapshots,
//! OS-automation calls, file transfers) may run. Rules are keyed by
//! operation-name patterns and enforced by one of four algorithms: sliding
//! window, token bucket, fixed window, or leaky bucket. A background memory
//! governor prunes expired and idle state and enforces a global budget.
//!
//! ```no_run
//! use turnstile::AdmissionEngine;
//!
//! let engine = AdmissionEngine::with_defaults();
//! let verdict = engine.check_and_record("screenshot.viewport", 1, None);
//! if verdict.allowed {
//!     // take the screenshot
//! }
//! ```

pub mod admission;
pub mod config;
pub mod error;

pub use admission::{
    AdmissionEngine, Algorithm, Clock, ManualClock, Rule, StatsSnapshot, SystemClock, Verdict,
};
pub use config::{EngineConfig, GovernorConfig};
pub use error::{EngineError, Result};
