//! # dbkeeper-testing
//!
//! Test infrastructure for dbkeeper.
//!
//! Provides [`MockLifecycle`], an in-memory connection factory whose
//! failures are scripted at runtime, so pool, executor and lifecycle
//! behavior can be exercised without a database server.
//!
//! Integration tests that need the pool live in this crate's `tests/`
//! directory rather than in `dbkeeper-client`, to keep dev-dependencies
//! free of cycles.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbkeeper_pool::{Pool, PoolConfig};
//! use dbkeeper_testing::MockLifecycle;
//!
//! let lifecycle = MockLifecycle::new();
//! lifecycle.refuse_next_connects(2);
//!
//! let pool = Pool::new(PoolConfig::new(), lifecycle.clone()).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock;

pub use mock::{MockConnection, MockError, MockLifecycle};
