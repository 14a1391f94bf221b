//! # dbkeeper-retry
//!
//! Pure building blocks for retrying database work.
//!
//! This crate has no I/O and never suspends. It answers two questions for
//! the executor that sits above it:
//!
//! - *Should this failure be retried?* ([`ErrorClassifier`])
//! - *How long should we wait before the next attempt?* ([`RetryPolicy`])
//!
//! ## Example
//!
//! ```rust
//! use dbkeeper_retry::{ErrorClassifier, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(200))
//!     .jitter_max(Duration::ZERO);
//!
//! assert_eq!(policy.base_delay(1), Duration::from_millis(200));
//! assert_eq!(policy.base_delay(2), Duration::from_millis(400));
//!
//! let classifier = ErrorClassifier::default();
//! assert!(classifier.is_retryable(&"read ECONNRESET: connection reset by peer"));
//! assert!(!classifier.is_retryable(&"unique constraint violation"));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod classify;
pub mod error;
pub mod policy;

pub use classify::{DEFAULT_SIGNATURES, ErrorClassifier, is_retryable};
pub use error::ConfigError;
pub use policy::RetryPolicy;
