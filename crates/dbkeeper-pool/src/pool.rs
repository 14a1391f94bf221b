//! Connection pool implementation.
//!
//! All bookkeeping (idle queue, checked-out count, connections being opened
//! or closed, waiting callers) lives behind one mutex. The mutex is never
//! held across an `.await`: connects, validations and teardowns run unlocked
//! and only re-take the lock to move a connection between states. Every
//! probe and close is bounded by a timeout, so a half-open socket cannot
//! stall a checkout, a return or a drain.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{BoxError, PoolError};
use crate::lifecycle::{ConnectionLifecycle, ConnectionMetadata};
use crate::reaper;

/// A bounded pool of database connections.
///
/// Connections are opened lazily through the pool's [`ConnectionLifecycle`],
/// validated when they have sat idle for longer than
/// [`PoolConfig::idle_timeout`], and retired once they reach
/// [`PoolConfig::max_uses`]. A background reaper keeps the pool at
/// [`PoolConfig::min_connections`].
///
/// `Pool` is a cheap handle; clones share the same connections.
///
/// # Example
///
/// ```rust,ignore
/// use dbkeeper_pool::{Pool, PoolConfig};
///
/// let pool = Pool::builder(lifecycle)
///     .min_connections(5)
///     .max_connections(20)
///     .build()
///     .await?;
///
/// let mut conn = pool.get().await?;
/// conn.query("SELECT 1").await?;
/// conn.release().await;
/// ```
pub struct Pool<L: ConnectionLifecycle> {
    inner: Arc<PoolInner<L>>,
}

pub(crate) struct PoolInner<L: ConnectionLifecycle> {
    /// Pool configuration.
    pub(crate) config: PoolConfig,

    /// Opens, validates and closes connections.
    pub(crate) lifecycle: L,

    /// Connection bookkeeping.
    pub(crate) state: Mutex<PoolState<L::Connection>>,

    /// Signalled whenever capacity frees up or a connection becomes idle.
    available: Notify,

    /// Signalled whenever a checked-out, opening or closing connection goes
    /// away.
    released: Notify,

    /// Whether the pool is closed.
    closed: AtomicBool,

    /// Counter for generating connection IDs.
    next_connection_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    pub(crate) metrics: Mutex<PoolMetricsInner>,

    /// Connections that failed to close after the pool was closed.
    teardown_failures: AtomicU32,

    /// Stops the background reaper between passes.
    pub(crate) shutdown: CancellationToken,
}

pub(crate) struct PoolState<C> {
    pub(crate) idle: VecDeque<IdleConnection<C>>,
    /// Connections handed out to callers.
    pub(crate) active: u32,
    /// Connections being opened.
    pub(crate) creating: u32,
    /// Connections being closed.
    pub(crate) closing: u32,
    /// Callers waiting for capacity.
    pub(crate) waiting: u32,
}

impl<C> PoolState<C> {
    fn idle_count(&self) -> u32 {
        u32::try_from(self.idle.len()).unwrap_or(u32::MAX)
    }

    pub(crate) fn total(&self) -> u32 {
        self.active
            .saturating_add(self.creating)
            .saturating_add(self.closing)
            .saturating_add(self.idle_count())
    }

    /// Connections a drain has to wait for.
    fn outstanding(&self) -> u32 {
        self.active
            .saturating_add(self.creating)
            .saturating_add(self.closing)
    }
}

pub(crate) struct IdleConnection<C> {
    pub(crate) conn: C,
    pub(crate) metadata: ConnectionMetadata,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
pub(crate) struct PoolMetricsInner {
    pub(crate) connections_created: u64,
    pub(crate) connections_closed: u64,
    pub(crate) checkouts_successful: u64,
    pub(crate) checkouts_failed: u64,
    pub(crate) validations_performed: u64,
    pub(crate) validations_failed: u64,
    pub(crate) connections_reaped: u64,
}

enum Slot<C> {
    Idle(IdleConnection<C>),
    Create,
}

#[derive(Clone, Copy)]
pub(crate) enum ReservationKind {
    Active,
    Creating,
    Closing,
}

/// Releases a counted slot on drop unless disarmed.
///
/// Created right after the matching counter was incremented, so a caller
/// dropping an in-flight future never leaks capacity.
pub(crate) struct Reservation<'a, L: ConnectionLifecycle> {
    pool: &'a PoolInner<L>,
    kind: ReservationKind,
    armed: bool,
}

impl<'a, L: ConnectionLifecycle> Reservation<'a, L> {
    pub(crate) fn new(pool: &'a PoolInner<L>, kind: ReservationKind) -> Self {
        Self {
            pool,
            kind,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<L: ConnectionLifecycle> Drop for Reservation<'_, L> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.pool.state.lock();
            match self.kind {
                ReservationKind::Active => state.active = state.active.saturating_sub(1),
                ReservationKind::Creating => state.creating = state.creating.saturating_sub(1),
                ReservationKind::Closing => state.closing = state.closing.saturating_sub(1),
            }
        }
        self.pool.slot_freed();
    }
}

/// Counts a caller in the wait queue for as long as it lives.
struct WaitGuard<'a, L: ConnectionLifecycle> {
    pool: &'a PoolInner<L>,
}

impl<'a, L: ConnectionLifecycle> WaitGuard<'a, L> {
    fn new(pool: &'a PoolInner<L>) -> Self {
        pool.state.lock().waiting += 1;
        Self { pool }
    }
}

impl<L: ConnectionLifecycle> Drop for WaitGuard<'_, L> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}

impl<L: ConnectionLifecycle> Pool<L> {
    /// Create a new pool builder for the given lifecycle.
    #[must_use]
    pub fn builder(lifecycle: L) -> PoolBuilder<L> {
        PoolBuilder::new(lifecycle)
    }

    /// Create a new pool with the given configuration.
    ///
    /// No connection is opened here; the reaper's first pass fills the pool
    /// up to `min_connections` in the background. Use [`Pool::warm_up`] to
    /// wait for that explicitly.
    pub async fn new(config: PoolConfig, lifecycle: L) -> Result<Self, PoolError> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            config: config.clone(),
            lifecycle,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_connections as usize),
                active: 0,
                creating: 0,
                closing: 0,
                waiting: 0,
            }),
            available: Notify::new(),
            released: Notify::new(),
            closed: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
            teardown_failures: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        });

        reaper::spawn(&inner);

        tracing::info!(
            min = config.min_connections,
            max = config.max_connections,
            "connection pool created"
        );

        Ok(Self { inner })
    }

    /// Get a connection from the pool.
    ///
    /// Returns an idle connection when one exists, opens a new one while the
    /// pool is below `max_connections`, and otherwise waits. Fails with
    /// [`PoolError::Exhausted`] once `acquire_timeout` has elapsed; the
    /// caller is removed from the wait queue at that point.
    pub async fn get(&self) -> Result<PooledConnection<L>, PoolError> {
        let started = Instant::now();
        let deadline = started + self.inner.config.acquire_timeout;

        tracing::trace!("acquiring connection from pool");

        let result = self.inner.acquire(deadline).await;

        {
            let mut metrics = self.inner.metrics.lock();
            if result.is_ok() {
                metrics.checkouts_successful += 1;
            } else {
                metrics.checkouts_failed += 1;
            }
        }

        match result {
            Ok(entry) => {
                tracing::trace!(
                    connection_id = entry.metadata.id,
                    wait_ms = started.elapsed().as_millis() as u64,
                    "connection checked out"
                );
                Ok(PooledConnection::new(entry, Arc::clone(&self.inner)))
            }
            Err(e) => {
                if e.is_exhausted() {
                    let status = self.status();
                    tracing::warn!(
                        timeout_ms = self.inner.config.acquire_timeout.as_millis() as u64,
                        active = status.active,
                        waiting = status.pending,
                        "connection pool exhausted"
                    );
                }
                Err(e)
            }
        }
    }

    /// Try to get an idle connection without waiting or opening a new one.
    ///
    /// Returns `None` if no fresh idle connection is immediately available.
    pub fn try_get(&self) -> Result<Option<PooledConnection<L>>, PoolError> {
        let mut state = self.inner.state.lock();
        if self.inner.is_closed() {
            return Err(PoolError::Closed);
        }

        let fresh = state
            .idle
            .back()
            .is_some_and(|entry| entry.metadata.idle_for() < self.inner.config.idle_timeout);
        if !fresh {
            return Ok(None);
        }

        let Some(mut entry) = state.idle.pop_back() else {
            return Ok(None);
        };
        state.active += 1;
        drop(state);

        entry.metadata.mark_checked_out();
        self.inner.metrics.lock().checkouts_successful += 1;
        Ok(Some(PooledConnection::new(entry, Arc::clone(&self.inner))))
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to [`PooledConnection::release`].
    pub async fn release(&self, conn: PooledConnection<L>) {
        conn.release().await;
    }

    /// Open connections until the pool holds `min_connections`.
    ///
    /// Returns the number of connections opened.
    pub async fn warm_up(&self) -> Result<u32, PoolError> {
        self.inner.ensure_min().await
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            max: self.inner.config.max_connections,
            min: self.inner.config.min_connections,
            active: state.active,
            idle: state.idle_count(),
            pending: state.waiting,
            creating: state.creating,
            closing: state.closing,
        }
    }

    /// Snapshot of pool sizes (max/min/active/idle/pending). Same as
    /// [`Pool::status`].
    #[must_use]
    pub fn stats(&self) -> PoolStatus {
        self.status()
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            validations_performed: inner.validations_performed,
            validations_failed: inner.validations_failed,
            connections_reaped: inner.connections_reaped,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Close the pool.
    ///
    /// New checkouts fail with [`PoolError::Closed`], waiting callers are
    /// woken with the same error and the reaper stops after the connection
    /// it is closing, if any. Connections returned after this point are
    /// destroyed instead of becoming idle. Idle connections stay open until
    /// [`Pool::drain`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.available.notify_waiters();
        tracing::info!("connection pool closed");
    }

    /// Close the pool and tear down its connections.
    ///
    /// Waits up to `grace` for checked-out connections to come back (and for
    /// connections already being opened or closed), then destroys every idle
    /// connection, each bounded by `destroy_timeout`. Connections still out
    /// when the grace period ends are reported as abandoned; they are
    /// destroyed whenever their holder returns them. Closes that failed or
    /// timed out after the pool was closed are counted in
    /// [`DrainReport::failed`].
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        self.close().await;

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outstanding = self.inner.state.lock().outstanding();
            if outstanding == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(
                    outstanding,
                    grace_ms = grace.as_millis() as u64,
                    "drain grace period elapsed with connections still checked out"
                );
                break;
            }
        }

        let idle: Vec<_> = self.inner.state.lock().idle.drain(..).collect();
        let destroyed = u32::try_from(idle.len()).unwrap_or(u32::MAX);
        for entry in idle {
            self.inner.destroy(entry).await;
        }

        let abandoned = self.inner.state.lock().outstanding();
        let failed = self.inner.teardown_failures.load(Ordering::Acquire);

        tracing::info!(destroyed, abandoned, failed, "connection pool drained");
        DrainReport {
            destroyed,
            abandoned,
            failed,
        }
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the lifecycle used to manage connections.
    #[must_use]
    pub fn lifecycle(&self) -> &L {
        &self.inner.lifecycle
    }
}

impl<L: ConnectionLifecycle> Clone for Pool<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: ConnectionLifecycle> fmt::Debug for Pool<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<L: ConnectionLifecycle> PoolInner<L> {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn slot_freed(&self) {
        self.available.notify_one();
        self.released.notify_waiters();
    }

    async fn acquire(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<IdleConnection<L::Connection>, PoolError> {
        let mut waiter: Option<WaitGuard<'_, L>> = None;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let slot = {
                let mut state = self.state.lock();
                if self.is_closed() {
                    return Err(PoolError::Closed);
                }
                if let Some(entry) = state.idle.pop_back() {
                    state.active += 1;
                    Some(Slot::Idle(entry))
                } else if state.total() < self.config.max_connections {
                    state.creating += 1;
                    Some(Slot::Create)
                } else {
                    None
                }
            };

            match slot {
                Some(Slot::Idle(entry)) => {
                    let reservation = Reservation::new(self, ReservationKind::Active);
                    match self.check_idle(entry, deadline).await {
                        Ok(mut entry) => {
                            reservation.disarm();
                            entry.metadata.mark_checked_out();
                            return Ok(entry);
                        }
                        Err(stale) => {
                            self.spawn_destroy(stale);
                            drop(reservation);
                            if Instant::now() >= deadline {
                                return Err(PoolError::Exhausted {
                                    timeout: self.config.acquire_timeout,
                                });
                            }
                        }
                    }
                }
                Some(Slot::Create) => {
                    let reservation = Reservation::new(self, ReservationKind::Creating);
                    let mut entry = self.create_connection(Some(deadline)).await?;

                    let opened = {
                        let mut state = self.state.lock();
                        if self.is_closed() {
                            false
                        } else {
                            state.creating = state.creating.saturating_sub(1);
                            state.active += 1;
                            true
                        }
                    };
                    if !opened {
                        drop(reservation);
                        self.destroy(entry).await;
                        return Err(PoolError::Closed);
                    }
                    reservation.disarm();
                    entry.metadata.mark_checked_out();
                    return Ok(entry);
                }
                None => {
                    if waiter.is_none() {
                        waiter = Some(WaitGuard::new(self));
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(PoolError::Exhausted {
                            timeout: self.config.acquire_timeout,
                        });
                    }
                }
            }
        }
    }

    /// Validate an idle connection that has outlived `idle_timeout`.
    ///
    /// The probe never outlives the caller's acquire deadline. A connection
    /// that fails validation is handed back as `Err` for teardown.
    async fn check_idle(
        &self,
        mut entry: IdleConnection<L::Connection>,
        acquire_deadline: Instant,
    ) -> Result<IdleConnection<L::Connection>, IdleConnection<L::Connection>> {
        if entry.metadata.idle_for() < self.config.idle_timeout {
            return Ok(entry);
        }

        let deadline = acquire_deadline.min(Instant::now() + self.config.validation_timeout);
        match self.validate(&mut entry, deadline).await {
            Ok(()) => Ok(entry),
            Err(e) => {
                tracing::warn!(
                    connection_id = entry.metadata.id,
                    error = %e,
                    "stale idle connection failed validation"
                );
                Err(entry)
            }
        }
    }

    /// Open a connection, retrying every `create_retry_interval` until
    /// `create_timeout` (or the caller's acquire deadline) passes.
    pub(crate) async fn create_connection(
        &self,
        acquire_deadline: Option<Instant>,
    ) -> Result<IdleConnection<L::Connection>, PoolError> {
        let create_deadline = Instant::now() + self.config.create_timeout;
        let (deadline, bounded_by_acquire) = match acquire_deadline {
            Some(acquire) if acquire < create_deadline => (acquire, true),
            _ => (create_deadline, false),
        };

        let mut last_error: Option<BoxError> = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match tokio::time::timeout_at(deadline, self.lifecycle.connect()).await {
                Ok(Ok(conn)) => {
                    let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    self.metrics.lock().connections_created += 1;
                    tracing::debug!(connection_id = id, attempt, "connection created");
                    return Ok(IdleConnection {
                        conn,
                        metadata: ConnectionMetadata::new(id),
                    });
                }
                Ok(Err(e)) => {
                    tracing::warn!(attempt, error = %e, "failed to create connection");
                    last_error = Some(e);
                }
                Err(_) => break,
            }

            if self.is_closed() {
                return Err(PoolError::Closed);
            }
            if Instant::now() + self.config.create_retry_interval >= deadline {
                break;
            }
            tokio::time::sleep(self.config.create_retry_interval).await;
        }

        Err(match last_error {
            Some(e) => PoolError::Connection(e),
            None if bounded_by_acquire => PoolError::Exhausted {
                timeout: self.config.acquire_timeout,
            },
            None => PoolError::CreateTimeout {
                timeout: self.config.create_timeout,
            },
        })
    }

    async fn validate(
        &self,
        entry: &mut IdleConnection<L::Connection>,
        deadline: Instant,
    ) -> Result<(), BoxError> {
        let result = tokio::time::timeout_at(deadline, self.lifecycle.validate(&mut entry.conn))
            .await
            .unwrap_or_else(|_| Err("validation probe timed out".into()));
        let mut metrics = self.metrics.lock();
        metrics.validations_performed += 1;
        if result.is_err() {
            metrics.validations_failed += 1;
        }
        result
    }

    /// Close a connection, giving up after `destroy_timeout`.
    pub(crate) async fn destroy(&self, entry: IdleConnection<L::Connection>) {
        let id = entry.metadata.id;
        let timeout = self.config.destroy_timeout;
        let result = match tokio::time::timeout(timeout, self.lifecycle.destroy(entry.conn)).await
        {
            Ok(result) => result,
            Err(_) => Err(format!("close timed out after {}ms", timeout.as_millis()).into()),
        };
        self.metrics.lock().connections_closed += 1;

        match result {
            Ok(()) => tracing::debug!(connection_id = id, "connection closed"),
            Err(e) => {
                tracing::warn!(connection_id = id, error = %e, "error while closing connection");
                if self.is_closed() {
                    self.teardown_failures.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
    }

    /// Close a connection in the background. It counts against
    /// `max_connections` until the close finishes.
    fn spawn_destroy(self: &Arc<Self>, entry: IdleConnection<L::Connection>) {
        self.state.lock().closing += 1;
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let reservation = Reservation::new(&pool, ReservationKind::Closing);
            pool.destroy(entry).await;
            drop(reservation);
        });
    }

    /// Take back a checked-out connection.
    async fn release(self: &Arc<Self>, mut entry: IdleConnection<L::Connection>) {
        let reservation = Reservation::new(self, ReservationKind::Active);

        let retire_reason = if self.is_closed() {
            Some("pool closed")
        } else if entry.metadata.use_count >= self.config.max_uses {
            Some("max uses reached")
        } else if self.config.validate_on_release {
            let deadline = Instant::now() + self.config.validation_timeout;
            match self.validate(&mut entry, deadline).await {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(
                        connection_id = entry.metadata.id,
                        error = %e,
                        "returned connection failed validation"
                    );
                    Some("validation failed")
                }
            }
        } else {
            None
        };

        if let Some(reason) = retire_reason {
            tracing::debug!(connection_id = entry.metadata.id, reason, "retiring connection");
            self.destroy(entry).await;
            drop(reservation);
            self.spawn_replenish();
            return;
        }

        entry.metadata.mark_idle();
        let returned = {
            let mut state = self.state.lock();
            if self.is_closed() {
                Some(entry)
            } else {
                state.active = state.active.saturating_sub(1);
                state.idle.push_back(entry);
                None
            }
        };

        match returned {
            // Closed while validating.
            Some(entry) => {
                self.destroy(entry).await;
                drop(reservation);
            }
            None => {
                reservation.disarm();
                self.slot_freed();
                tracing::trace!("connection returned to pool");
            }
        }
    }

    /// Destroy a checked-out connection without returning it.
    async fn retire(self: &Arc<Self>, entry: IdleConnection<L::Connection>) {
        let reservation = Reservation::new(self, ReservationKind::Active);
        self.destroy(entry).await;
        drop(reservation);
        self.spawn_replenish();
    }

    /// Drop a checked-out connection from the books without closing it.
    fn forget_active(&self) {
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.slot_freed();
    }

    fn spawn_replenish(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let below_min = self.state.lock().total() < self.config.min_connections;
        if !below_min {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pool.ensure_min().await {
                tracing::warn!(error = %e, "failed to replace retired connection");
            }
        });
    }

    /// Open idle connections until the pool holds `min_connections`.
    pub(crate) async fn ensure_min(&self) -> Result<u32, PoolError> {
        let mut opened = 0;

        loop {
            let reservation = {
                let mut state = self.state.lock();
                if self.is_closed() || state.total() >= self.config.min_connections {
                    break;
                }
                state.creating += 1;
                Reservation::new(self, ReservationKind::Creating)
            };

            let mut entry = self.create_connection(None).await?;
            entry.metadata.mark_idle();

            let leftover = {
                let mut state = self.state.lock();
                if self.is_closed() {
                    Some(entry)
                } else {
                    state.creating = state.creating.saturating_sub(1);
                    state.idle.push_back(entry);
                    None
                }
            };

            match leftover {
                Some(entry) => {
                    drop(reservation);
                    self.destroy(entry).await;
                    break;
                }
                None => {
                    reservation.disarm();
                    self.available.notify_one();
                    opened += 1;
                }
            }
        }

        if opened > 0 {
            tracing::debug!(opened, "pool replenished to minimum size");
        }
        Ok(opened)
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder(lifecycle)
///     .pool_config(pool_config)
///     .build()
///     .await?;
/// ```
pub struct PoolBuilder<L: ConnectionLifecycle> {
    lifecycle: L,
    pool_config: PoolConfig,
}

impl<L: ConnectionLifecycle> PoolBuilder<L> {
    /// Create a new pool builder with default settings.
    pub fn new(lifecycle: L) -> Self {
        Self {
            lifecycle,
            pool_config: PoolConfig::default(),
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.pool_config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.acquire_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Set the number of checkouts after which a connection is retired.
    #[must_use]
    pub fn max_uses(mut self, uses: u32) -> Self {
        self.pool_config.max_uses = uses;
        self
    }

    /// Build the pool.
    pub async fn build(self) -> Result<Pool<L>, PoolError> {
        Pool::new(self.pool_config, self.lifecycle).await
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Maximum allowed connections.
    pub max: u32,
    /// Minimum connections the reaper maintains.
    pub min: u32,
    /// Connections currently checked out.
    pub active: u32,
    /// Idle connections available.
    pub idle: u32,
    /// Callers waiting for a connection.
    pub pending: u32,
    /// Connections being opened.
    pub creating: u32,
    /// Connections being closed.
    pub closing: u32,
}

impl PoolStatus {
    /// Total number of connections, including ones being opened or closed.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.active + self.idle + self.creating + self.closing
    }

    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (f64::from(self.active) / f64::from(self.max)) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total() >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, pool closed, etc.).
    pub checkouts_failed: u64,
    /// Validation probes performed.
    pub validations_performed: u64,
    /// Validation probes that failed.
    pub validations_failed: u64,
    /// Idle connections destroyed by the reaper.
    pub connections_reaped: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate validation success rate (0.0 to 1.0).
    #[must_use]
    pub fn validation_success_rate(&self) -> f64 {
        if self.validations_performed == 0 {
            return 1.0;
        }
        let successful = self.validations_performed - self.validations_failed;
        successful as f64 / self.validations_performed as f64
    }
}

/// Outcome of [`Pool::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Idle connections destroyed by the drain.
    pub destroyed: u32,
    /// Connections still checked out when the grace period ended.
    pub abandoned: u32,
    /// Connections whose close failed or timed out after the pool closed.
    pub failed: u32,
}

/// A connection retrieved from the pool.
///
/// Dereferences to the underlying connection. When dropped, the connection
/// is returned to the pool on the current runtime; prefer
/// [`release`](PooledConnection::release) to wait for the return to finish.
pub struct PooledConnection<L: ConnectionLifecycle> {
    entry: Option<IdleConnection<L::Connection>>,
    pool: Arc<PoolInner<L>>,
}

impl<L: ConnectionLifecycle> PooledConnection<L> {
    fn new(entry: IdleConnection<L::Connection>, pool: Arc<PoolInner<L>>) -> Self {
        Self {
            entry: Some(entry),
            pool,
        }
    }

    #[allow(clippy::expect_used)] // only emptied by methods that consume self
    fn entry(&self) -> &IdleConnection<L::Connection> {
        self.entry.as_ref().expect("pooled connection already returned")
    }

    #[allow(clippy::expect_used)] // only emptied by methods that consume self
    fn entry_mut(&mut self) -> &mut IdleConnection<L::Connection> {
        self.entry.as_mut().expect("pooled connection already returned")
    }

    /// Get the connection metadata.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.entry().metadata
    }

    /// Return the connection to the pool.
    ///
    /// The connection is validated first (if configured); a connection that
    /// fails validation or has reached `max_uses` is destroyed and, if the
    /// pool dropped below its minimum, replaced.
    pub async fn release(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry).await;
        }
    }

    /// Destroy the connection instead of returning it.
    ///
    /// Use this when the caller knows the connection is broken.
    pub async fn discard(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.retire(entry).await;
        }
    }

    /// Detach the connection from the pool.
    ///
    /// The pool stops accounting for the connection and the caller becomes
    /// responsible for closing it.
    #[allow(clippy::expect_used)] // entry is always present before consumption
    pub fn detach(mut self) -> L::Connection {
        let entry = self.entry.take().expect("pooled connection already returned");
        self.pool.forget_active();
        tracing::debug!(connection_id = entry.metadata.id, "connection detached from pool");
        entry.conn
    }
}

impl<L: ConnectionLifecycle> Deref for PooledConnection<L> {
    type Target = L::Connection;

    fn deref(&self) -> &Self::Target {
        &self.entry().conn
    }
}

impl<L: ConnectionLifecycle> DerefMut for PooledConnection<L> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entry_mut().conn
    }
}

impl<L: ConnectionLifecycle> fmt::Debug for PooledConnection<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("metadata", &self.entry.as_ref().map(|e| &e.metadata))
            .finish()
    }
}

impl<L: ConnectionLifecycle> Drop for PooledConnection<L> {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = Arc::clone(&self.pool);
            handle.spawn(async move {
                pool.release(entry).await;
            });
        } else {
            tracing::warn!(
                connection_id = entry.metadata.id,
                "no runtime available; dropping connection without returning it"
            );
            drop(entry);
            self.pool.metrics.lock().connections_closed += 1;
            self.pool.forget_active();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingLifecycle {
        connects: AtomicU32,
        fail_validation: AtomicBool,
    }

    #[async_trait]
    impl ConnectionLifecycle for CountingLifecycle {
        type Connection = u32;

        async fn connect(&self) -> Result<u32, BoxError> {
            Ok(self.connects.fetch_add(1, Ordering::SeqCst))
        }

        async fn validate(&self, _conn: &mut u32) -> Result<(), BoxError> {
            if self.fail_validation.load(Ordering::SeqCst) {
                Err("validation failed".into())
            } else {
                Ok(())
            }
        }
    }

    fn config() -> PoolConfig {
        PoolConfig::new()
            .min_connections(0)
            .max_connections(2)
            .acquire_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            max: 20,
            min: 0,
            active: 5,
            idle: 5,
            pending: 0,
            creating: 0,
            closing: 0,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
        assert_eq!(status.total(), 10);
    }

    #[test]
    fn test_pool_status_at_capacity() {
        let status = PoolStatus {
            max: 10,
            min: 0,
            active: 10,
            idle: 0,
            pending: 3,
            creating: 0,
            closing: 0,
        };
        assert!(status.is_at_capacity());

        let status2 = PoolStatus {
            max: 20,
            min: 0,
            active: 5,
            idle: 5,
            pending: 0,
            creating: 0,
            closing: 0,
        };
        assert!(!status2.is_at_capacity());
    }

    #[test]
    fn test_pool_metrics_success_rates() {
        let metrics = PoolMetrics {
            connections_created: 10,
            connections_closed: 2,
            checkouts_successful: 90,
            checkouts_failed: 10,
            validations_performed: 100,
            validations_failed: 5,
            connections_reaped: 1,
            uptime: Duration::from_secs(3600),
        };

        assert!((metrics.checkout_success_rate() - 0.9).abs() < f64::EPSILON);
        assert!((metrics.validation_success_rate() - 0.95).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_builder_fluent() {
        let pool = Pool::builder(CountingLifecycle::default())
            .min_connections(1)
            .max_connections(50)
            .max_uses(10)
            .build()
            .await
            .unwrap();

        assert_eq!(pool.config().min_connections, 1);
        assert_eq!(pool.config().max_connections, 50);
        assert_eq!(pool.config().max_uses, 10);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = Pool::new(
            PoolConfig::new().min_connections(3).max_connections(1),
            CountingLifecycle::default(),
        )
        .await;
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_reuses_connection() {
        let pool = Pool::new(config(), CountingLifecycle::default()).await.unwrap();

        let conn = pool.get().await.unwrap();
        let id = conn.metadata().id;
        assert_eq!(pool.status().active, 1);
        conn.release().await;

        let status = pool.status();
        assert_eq!((status.active, status.idle), (0, 1));

        let conn = pool.get().await.unwrap();
        assert_eq!(conn.metadata().id, id);
        assert_eq!(conn.metadata().use_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_reports_bounds_and_counts() {
        let pool = Pool::new(config(), CountingLifecycle::default()).await.unwrap();
        let _conn = pool.get().await.unwrap();

        let stats = pool.stats();
        assert_eq!((stats.max, stats.min), (2, 0));
        assert_eq!((stats.active, stats.idle, stats.pending), (1, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_get_only_returns_idle() {
        let pool = Pool::new(config(), CountingLifecycle::default()).await.unwrap();
        assert!(pool.try_get().unwrap().is_none());

        pool.get().await.unwrap().release().await;
        let conn = pool.try_get().unwrap();
        assert!(conn.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_frees_capacity() {
        let pool = Pool::new(config(), CountingLifecycle::default()).await.unwrap();
        let conn = pool.get().await.unwrap();
        let raw = conn.detach();
        assert_eq!(raw, 0);
        assert_eq!(pool.status().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_release_validation_destroys() {
        let pool = Pool::new(config(), CountingLifecycle::default()).await.unwrap();
        let conn = pool.get().await.unwrap();
        pool.lifecycle().fail_validation.store(true, Ordering::SeqCst);
        conn.release().await;

        assert_eq!(pool.status().total(), 0);
        assert_eq!(pool.metrics().connections_closed, 1);
    }

    #[test]
    fn test_drop_outside_runtime_forgets_connection() {
        let (pool, conn) = tokio_test::block_on(async {
            let pool = Pool::new(config(), CountingLifecycle::default()).await.unwrap();
            let conn = pool.get().await.unwrap();
            (pool, conn)
        });

        drop(conn);

        assert_eq!(pool.status().total(), 0);
        assert_eq!(pool.metrics().connections_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_pool_rejects_get() {
        let pool = Pool::new(config(), CountingLifecycle::default()).await.unwrap();
        pool.close().await;
        assert!(matches!(pool.get().await, Err(PoolError::Closed)));
        assert!(matches!(pool.try_get(), Err(PoolError::Closed)));
    }
}
