//! Retry configuration errors.

use thiserror::Error;

/// Errors raised when a [`RetryPolicy`](crate::RetryPolicy) is inconsistent.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The backoff factor is below 1.0 or not a finite number.
    #[error("invalid backoff factor {0}: must be finite and >= 1.0")]
    InvalidBackoffFactor(f64),

    /// The initial delay exceeds the configured cap.
    #[error("initial delay {initial_ms}ms exceeds max delay {max_ms}ms")]
    InitialDelayAboveMax {
        /// Initial delay in milliseconds.
        initial_ms: u128,
        /// Maximum delay in milliseconds.
        max_ms: u128,
    },
}
