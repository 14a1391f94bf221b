//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by a [`ConnectionLifecycle`](crate::ConnectionLifecycle).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while using the pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No connection became available before the acquire deadline.
    #[error("pool exhausted: no connection available within {timeout:?}")]
    Exhausted {
        /// The acquire timeout that elapsed.
        timeout: Duration,
    },

    /// The pool has been closed and refuses new checkouts.
    #[error("pool is closed")]
    Closed,

    /// The lifecycle failed to open a new connection.
    #[error("connection failed: {0}")]
    Connection(#[source] BoxError),

    /// Opening a connection did not finish within the create timeout.
    #[error("timed out creating connection after {timeout:?}")]
    CreateTimeout {
        /// The create timeout that elapsed.
        timeout: Duration,
    },

    /// The pool configuration is inconsistent.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Whether this error means the caller timed out waiting for capacity.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
