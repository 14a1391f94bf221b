//! Connection lifecycle management.
//!
//! The pool never talks to a database itself. Everything it knows about a
//! connection goes through a [`ConnectionLifecycle`]: how to open one, how to
//! check that it still works, and how to tear it down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::BoxError;

/// Factory, validator and destructor for pooled connections.
///
/// # Example
///
/// ```rust,ignore
/// struct PgLifecycle { url: String }
///
/// #[async_trait]
/// impl ConnectionLifecycle for PgLifecycle {
///     type Connection = PgClient;
///
///     async fn connect(&self) -> Result<PgClient, BoxError> {
///         Ok(PgClient::connect(&self.url).await?)
///     }
///
///     async fn validate(&self, conn: &mut PgClient) -> Result<(), BoxError> {
///         conn.simple_query("SELECT 1").await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ConnectionLifecycle: Send + Sync + 'static {
    /// The opaque client handle managed by the pool.
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection, BoxError>;

    /// Run a lightweight round-trip against the connection.
    async fn validate(&self, conn: &mut Self::Connection) -> Result<(), BoxError>;

    /// Close the connection. The default implementation drops it.
    async fn destroy(&self, conn: Self::Connection) -> Result<(), BoxError> {
        drop(conn);
        Ok(())
    }
}

/// A shared lifecycle.
pub type DynConnectionLifecycle<C> = Arc<dyn ConnectionLifecycle<Connection = C>>;

#[async_trait]
impl<L: ConnectionLifecycle + ?Sized> ConnectionLifecycle for Arc<L> {
    type Connection = L::Connection;

    async fn connect(&self) -> Result<Self::Connection, BoxError> {
        (**self).connect().await
    }

    async fn validate(&self, conn: &mut Self::Connection) -> Result<(), BoxError> {
        (**self).validate(conn).await
    }

    async fn destroy(&self, conn: Self::Connection) -> Result<(), BoxError> {
        (**self).destroy(conn).await
    }
}

/// Where a connection currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Sitting in the idle queue.
    Idle,
    /// Handed out to exactly one caller.
    CheckedOut,
}

/// Bookkeeping the pool keeps for every connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Pool-unique connection id.
    pub id: u64,
    /// When the connection was opened.
    pub created_at: Instant,
    /// When the connection was last checked out or returned.
    pub last_used: Instant,
    /// Number of times the connection has been checked out.
    pub use_count: u32,
    /// Current location of the connection.
    pub state: ConnectionState,
}

impl ConnectionMetadata {
    pub(crate) fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used: now,
            use_count: 0,
            state: ConnectionState::Idle,
        }
    }

    /// Time since the connection was opened.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last touched.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn mark_checked_out(&mut self) {
        self.use_count = self.use_count.saturating_add(1);
        self.last_used = Instant::now();
        self.state = ConnectionState::CheckedOut;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.last_used = Instant::now();
        self.state = ConnectionState::Idle;
    }
}
