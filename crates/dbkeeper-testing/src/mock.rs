//! Scriptable in-memory database connections.
//!
//! [`MockLifecycle`] is a [`ConnectionLifecycle`] whose failures can be
//! scripted at runtime: refuse the next N connects, take the whole "server"
//! down, fail or hang validations, slow down connects and closes, or make
//! queries fail with a given message. Every clone shares the same script and counters, so a test
//! keeps one handle while the pool owns another.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dbkeeper_pool::{BoxError, ConnectionLifecycle};
use parking_lot::Mutex;
use thiserror::Error;

/// Error raised by the mock "server".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MockError(pub String);

impl From<MockError> for dbkeeper_client::Error {
    fn from(e: MockError) -> Self {
        Self::from_database(&e)
    }
}

#[derive(Debug, Default)]
struct Script {
    next_id: AtomicU64,
    connects: AtomicU32,
    validates: AtomicU32,
    destroys: AtomicU32,
    queries: AtomicU32,
    open: AtomicU32,
    down: AtomicBool,
    fail_validation: AtomicBool,
    hang_validation: AtomicBool,
    fail_destroy: AtomicBool,
    refuse_connects: AtomicU32,
    connect_error: Mutex<Option<String>>,
    connect_delay: Mutex<Duration>,
    destroy_delay: Mutex<Duration>,
    query_failures: Mutex<VecDeque<String>>,
}

impl Script {
    fn refusal(&self) -> String {
        self.connect_error
            .lock()
            .clone()
            .unwrap_or_else(|| "connect ECONNREFUSED 127.0.0.1:5432".to_string())
    }
}

/// Scriptable [`ConnectionLifecycle`] producing [`MockConnection`]s.
#[derive(Debug, Clone, Default)]
pub struct MockLifecycle {
    script: Arc<Script>,
}

impl MockLifecycle {
    /// Create a lifecycle whose server is up.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Take the server down (or bring it back). While down, connects,
    /// validations and queries all fail.
    pub fn set_down(&self, down: bool) {
        self.script.down.store(down, Ordering::SeqCst);
    }

    /// Refuse the next `count` connects.
    pub fn refuse_next_connects(&self, count: u32) {
        self.script.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Message used for refused connects.
    pub fn set_connect_error(&self, message: impl Into<String>) {
        *self.script.connect_error.lock() = Some(message.into());
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.script.connect_delay.lock() = delay;
    }

    /// Make validations fail.
    pub fn set_fail_validation(&self, fail: bool) {
        self.script.fail_validation.store(fail, Ordering::SeqCst);
    }

    /// Make validation probes never answer, like a half-open socket.
    pub fn set_hang_validation(&self, hang: bool) {
        self.script.hang_validation.store(hang, Ordering::SeqCst);
    }

    /// Delay every destroy by `delay`.
    pub fn set_destroy_delay(&self, delay: Duration) {
        *self.script.destroy_delay.lock() = delay;
    }

    /// Make destroys report an error (the connection is still closed).
    pub fn set_fail_destroy(&self, fail: bool) {
        self.script.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Fail the next queries, one per message, in order.
    pub fn fail_next_queries<I, S>(&self, messages: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script
            .query_failures
            .lock()
            .extend(messages.into_iter().map(Into::into));
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Connect attempts, successful or not.
    #[must_use]
    pub fn connects(&self) -> u32 {
        self.script.connects.load(Ordering::SeqCst)
    }

    /// Validation probes issued.
    #[must_use]
    pub fn validates(&self) -> u32 {
        self.script.validates.load(Ordering::SeqCst)
    }

    /// Connections destroyed.
    #[must_use]
    pub fn destroys(&self) -> u32 {
        self.script.destroys.load(Ordering::SeqCst)
    }

    /// Queries issued, successful or not.
    #[must_use]
    pub fn queries(&self) -> u32 {
        self.script.queries.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet destroyed.
    #[must_use]
    pub fn open_connections(&self) -> u32 {
        self.script.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionLifecycle for MockLifecycle {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, BoxError> {
        let script = &self.script;
        script.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *script.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let refused = script
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused || script.down.load(Ordering::SeqCst) {
            return Err(Box::new(MockError(script.refusal())));
        }

        let id = script.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        script.open.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(id, "mock connection opened");
        Ok(MockConnection {
            id,
            script: Arc::clone(script),
        })
    }

    async fn validate(&self, conn: &mut MockConnection) -> Result<(), BoxError> {
        self.script.validates.fetch_add(1, Ordering::SeqCst);
        if self.script.hang_validation.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.script.fail_validation.load(Ordering::SeqCst) {
            return Err(Box::new(MockError(format!(
                "connection {} failed validation",
                conn.id
            ))));
        }
        conn.ping().await.map_err(Into::into)
    }

    async fn destroy(&self, conn: MockConnection) -> Result<(), BoxError> {
        self.script.destroys.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.destroy_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.script.open.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(id = conn.id, "mock connection closed");
        if self.script.fail_destroy.load(Ordering::SeqCst) {
            return Err(Box::new(MockError(format!(
                "error closing connection {}",
                conn.id
            ))));
        }
        Ok(())
    }
}

/// A connection to the mock server.
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    script: Arc<Script>,
}

impl MockConnection {
    /// Lifecycle-unique connection id, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Round-trip used by validation. Fails only while the server is down;
    /// scripted query failures are left for [`MockConnection::query`].
    pub async fn ping(&mut self) -> Result<(), MockError> {
        tokio::task::yield_now().await;
        if self.script.down.load(Ordering::SeqCst) {
            return Err(MockError("server closed the connection unexpectedly".into()));
        }
        Ok(())
    }

    /// Run a statement. Echoes it back unless a failure is scripted.
    pub async fn query(&mut self, sql: &str) -> Result<String, MockError> {
        self.script.queries.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        if self.script.down.load(Ordering::SeqCst) {
            return Err(MockError("server closed the connection unexpectedly".into()));
        }
        if let Some(message) = self.script.query_failures.lock().pop_front() {
            return Err(MockError(message));
        }
        Ok(format!("{}:{sql}", self.id))
    }
}
