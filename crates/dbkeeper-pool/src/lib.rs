//! # dbkeeper-pool
//!
//! Bounded async connection pool with lifecycle management.
//!
//! The pool manages opaque client handles through a [`ConnectionLifecycle`]
//! implementation, so it works with any database client that can open,
//! probe and close a connection.
//!
//! ## Features
//!
//! - Configurable min/max pool sizes with lazy connection creation
//! - Hard acquire deadline surfaced as [`PoolError::Exhausted`]
//! - Validation of stale idle connections before checkout and of every
//!   connection on return, with every probe and close bounded by a timeout
//! - Connection retirement after a configurable number of uses
//! - Background reaper that destroys expired idle connections and keeps the
//!   pool at its minimum size
//! - Graceful close and drain for coordinated shutdown
//! - Status snapshot and metrics for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbkeeper_pool::{Pool, PoolConfig};
//! use std::time::Duration;
//!
//! let pool = Pool::builder(PgLifecycle::new(url))
//!     .min_connections(2)
//!     .max_connections(10)
//!     .acquire_timeout(Duration::from_secs(5))
//!     .build()
//!     .await?;
//!
//! let mut conn = pool.get().await?;
//! conn.simple_query("SELECT 1").await?;
//! conn.release().await;
//!
//! let status = pool.status();
//! tracing::info!(active = status.active, idle = status.idle, "pool status");
//!
//! // On shutdown: refuse new checkouts, wait for returns, close everything.
//! let report = pool.drain(Duration::from_secs(10)).await;
//! assert_eq!(report.abandoned, 0);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;
mod reaper;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::{BoxError, PoolError};

// Pool types
pub use pool::{DrainReport, Pool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection};

// Lifecycle management
pub use lifecycle::{
    ConnectionLifecycle, ConnectionMetadata, ConnectionState, DynConnectionLifecycle,
};
