//! # dbkeeper-client
//!
//! Resilient access to a relational database.
//!
//! This is the primary public API surface of the dbkeeper project. It sits
//! between application code and an opaque database client, owning
//! connection pooling, retries, health reporting and shutdown.
//!
//! ## Features
//!
//! - **Retrying executor**: transient failures are retried with exponential
//!   backoff and jitter; fatal ones surface immediately
//! - **Pluggable classification**: the table of transient-error signatures
//!   can be extended without touching call sites
//! - **Health checks**: probes that always produce a record, never an error
//! - **Coordinated lifecycle**: connect-with-retry at startup and a
//!   best-effort, exactly-once shutdown driven by a cancellation signal
//! - **Environment configuration** and structured logging setup
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbkeeper_client::{Database, Settings, ShutdownSignal, logging};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_env()?;
//!     logging::init_from_settings(&settings);
//!
//!     let db = Database::from_settings(&settings, PgLifecycle::new(&settings.database_url));
//!     db.connect().await?;
//!
//!     let signal = ShutdownSignal::new();
//!     signal.listen_for_termination();
//!     let shutdown = db.shutdown_on(signal);
//!
//!     let health = db.check().await;
//!     println!("healthy: {} ({}ms)", health.healthy, health.latency_ms);
//!
//!     shutdown.await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod health;
pub mod logging;
pub mod shutdown;
pub mod state;

// Re-export commonly used types
pub use config::{Environment, Settings, redact_connection_string};
pub use database::{Database, DatabaseConfig, ShutdownReport, StartupPolicy};
pub use error::{Error, Result};
pub use executor::{Executor, RETRY_WARNING, retry};
pub use health::{HealthMonitor, HealthProbe, HealthRecord};
pub use shutdown::ShutdownSignal;
pub use state::LifecycleState;

pub use dbkeeper_pool::{
    BoxError, ConnectionLifecycle, Pool, PoolConfig, PoolError, PoolStatus, PooledConnection,
};
pub use dbkeeper_retry::{ErrorClassifier, RetryPolicy, is_retryable};
