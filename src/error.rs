//! Error types for the Turnstile engine.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Only rule configuration and config-file loading can fail; request-path
/// operations are total and fail open when no rule resolves.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Rule rejected because `max_operations` is zero.
    #[error("invalid rule for {pattern:?}: max_operations must be greater than zero")]
    InvalidMaxOperations { pattern: String },

    /// Rule rejected because `window_ms` is zero.
    #[error("invalid rule for {pattern:?}: window_ms must be greater than zero")]
    InvalidWindow { pattern: String },

    /// Rule rejected because the burst size is below the base limit.
    #[error(
        "invalid rule for {pattern:?}: burst_size {burst_size} is below max_operations {max_operations}"
    )]
    BurstBelowLimit {
        pattern: String,
        burst_size: u64,
        max_operations: u64,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, EngineError>;
