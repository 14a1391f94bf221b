//! Error types for the database layer.

use std::fmt;
use std::time::Duration;

use dbkeeper_pool::PoolError;
use dbkeeper_retry::ErrorClassifier;
use thiserror::Error;

use crate::state::LifecycleState;

/// Result type for the database layer.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the database layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A network, timeout or capacity failure that may succeed on retry.
    #[error("transient connection error: {0}")]
    TransientConnection(String),

    /// A failure that retrying will not fix (constraint, syntax, auth, ...).
    #[error("query failed: {0}")]
    FatalQuery(String),

    /// No pooled connection became available in time.
    #[error("pool exhausted: no connection available within {timeout:?}")]
    PoolExhausted {
        /// The acquire timeout that elapsed.
        timeout: Duration,
    },

    /// The operation is not allowed in the current lifecycle state.
    #[error("cannot {operation} while the database layer is {state}")]
    Lifecycle {
        /// The refused operation.
        operation: &'static str,
        /// The state at the time of the call.
        state: LifecycleState,
    },

    /// A teardown step failed during shutdown.
    #[error("shutdown step '{step}' failed: {message}")]
    ShutdownStep {
        /// Name of the teardown step.
        step: &'static str,
        /// What went wrong.
        message: String,
    },

    /// Any other pool failure.
    #[error(transparent)]
    Pool(PoolError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a database error as transient or fatal according to `classifier`.
    ///
    /// The original message is kept verbatim so that later classification of
    /// the wrapped error gives the same answer.
    pub fn classify<E: fmt::Display + ?Sized>(error: &E, classifier: &ErrorClassifier) -> Self {
        let message = error.to_string();
        if classifier.is_retryable(&message) {
            Self::TransientConnection(message)
        } else {
            Self::FatalQuery(message)
        }
    }

    /// Wrap a database error using the default signature table.
    pub fn from_database<E: fmt::Display + ?Sized>(error: &E) -> Self {
        Self::classify(error, &ErrorClassifier::default())
    }

    /// Whether the executor would retry this error with the default table.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientConnection(_) | Self::PoolExhausted { .. } => true,
            Self::Pool(e) => dbkeeper_retry::is_retryable(e),
            _ => false,
        }
    }
}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted { timeout } => Self::PoolExhausted { timeout },
            PoolError::Configuration(message) => Self::Config(message),
            other => Self::Pool(other),
        }
    }
}

impl From<dbkeeper_retry::ConfigError> for Error {
    fn from(e: dbkeeper_retry::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
