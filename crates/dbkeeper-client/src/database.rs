//! Process-scoped database coordinator.
//!
//! A [`Database`] owns the primary client, the connection pool built on top
//! of it and the lifecycle state machine:
//!
//! ```text
//! Uninitialized -> Connecting -> Ready -> Draining -> Closed
//!                       |
//!                       +-> Failed
//! ```
//!
//! Create one at startup and hand clones to collaborators. Nothing is opened
//! until [`Database::connect`] (or the first [`Database::acquire`] /
//! [`Database::execute`]) runs, and [`Database::shutdown`] tears everything
//! down exactly once no matter how many tasks call it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbkeeper_pool::{
    ConnectionLifecycle, DrainReport, Pool, PoolConfig, PoolError, PooledConnection,
};
use dbkeeper_retry::{ErrorClassifier, RetryPolicy};
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::health::{HealthMonitor, HealthProbe, HealthRecord};
use crate::shutdown::ShutdownSignal;
use crate::state::LifecycleState;

/// Backoff for the startup connect loop.
///
/// Independent of the executor's [`RetryPolicy`]: the delay starts at
/// `initial_delay` and is multiplied by `multiplier` after every failed
/// attempt, without jitter or cap.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupPolicy {
    /// Connect attempts before giving up.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth factor applied to the delay after each failure.
    pub multiplier: f64,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

/// Configuration for a [`Database`].
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Pool configuration.
    pub pool: PoolConfig,
    /// Default retry policy for [`Database::execute`].
    pub retry: RetryPolicy,
    /// Startup connect-with-retry policy.
    pub startup: StartupPolicy,
    /// How long shutdown waits for checked-out connections.
    pub shutdown_grace: Duration,
    /// Health probes slower than this are reported unhealthy.
    pub health_timeout: Option<Duration>,
    /// Decides which errors are transient.
    pub classifier: Arc<ErrorClassifier>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            startup: StartupPolicy::default(),
            shutdown_grace: Duration::from_secs(10),
            health_timeout: Some(Duration::from_secs(5)),
            classifier: Arc::new(ErrorClassifier::default()),
        }
    }
}

impl DatabaseConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the default retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the startup policy.
    #[must_use]
    pub fn startup(mut self, startup: StartupPolicy) -> Self {
        self.startup = startup;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set (or clear) the health probe timeout.
    #[must_use]
    pub fn health_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Set the error classifier.
    #[must_use]
    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }
}

/// What a call to [`Database::shutdown`] did.
#[derive(Debug)]
pub struct ShutdownReport {
    /// Whether this call ran the teardown. `false` for every caller but the
    /// first.
    pub performed: bool,
    /// State observed when the call started.
    pub previous_state: LifecycleState,
    /// Pool drain outcome, if a pool existed.
    pub drain: Option<DrainReport>,
    /// Teardown steps that failed. Later steps ran regardless.
    pub failures: Vec<Error>,
}

impl ShutdownReport {
    fn skipped(previous_state: LifecycleState) -> Self {
        Self {
            performed: false,
            previous_state,
            drain: None,
            failures: Vec::new(),
        }
    }

    /// Whether every teardown step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Process-scoped owner of the database client and pool.
///
/// # Example
///
/// ```rust,ignore
/// let settings = Settings::from_env()?;
/// let db = Database::from_settings(&settings, PgLifecycle::new(&settings.database_url));
///
/// if !db.connect_with_retry(5, Duration::from_secs(1)).await {
///     std::process::exit(1);
/// }
///
/// let signal = ShutdownSignal::new();
/// signal.listen_for_termination();
/// let shutdown = db.shutdown_on(signal);
///
/// let users: i64 = db
///     .execute(|conn| Box::pin(async move { conn.count_users().await }), None)
///     .await?;
///
/// shutdown.await?;
/// ```
pub struct Database<L: ConnectionLifecycle> {
    inner: Arc<DatabaseInner<L>>,
}

struct DatabaseInner<L: ConnectionLifecycle> {
    config: DatabaseConfig,
    lifecycle: Arc<L>,
    state: watch::Sender<LifecycleState>,
    /// The client opened by the startup loop; used for health probes.
    primary: AsyncMutex<Option<L::Connection>>,
    /// Set once the layer is ready.
    ready: parking_lot::Mutex<Option<Executor<Arc<L>>>>,
    /// Serializes startup and teardown.
    init: AsyncMutex<()>,
    shutdown: ShutdownSignal,
    monitor: HealthMonitor,
}

impl<L: ConnectionLifecycle> Database<L> {
    /// Create an uninitialized coordinator. Nothing is opened yet.
    pub fn new(config: DatabaseConfig, lifecycle: L) -> Self {
        let (state, _) = watch::channel(LifecycleState::Uninitialized);
        let monitor = match config.health_timeout {
            Some(timeout) => HealthMonitor::new().with_timeout(timeout),
            None => HealthMonitor::new(),
        };

        Self {
            inner: Arc::new(DatabaseInner {
                config,
                lifecycle: Arc::new(lifecycle),
                state,
                primary: AsyncMutex::new(None),
                ready: parking_lot::Mutex::new(None),
                init: AsyncMutex::new(()),
                shutdown: ShutdownSignal::new(),
                monitor,
            }),
        }
    }

    /// Create a coordinator from environment settings.
    pub fn from_settings(settings: &Settings, lifecycle: L) -> Self {
        Self::new(settings.database_config(), lifecycle)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// The configuration this coordinator was built with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Signal fired when shutdown starts.
    #[must_use]
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.inner.shutdown
    }

    /// The pool, once the layer is ready.
    #[must_use]
    pub fn pool(&self) -> Option<Pool<Arc<L>>> {
        self.inner.ready.lock().as_ref().map(|ex| ex.pool().clone())
    }

    /// The executor, once the layer is ready.
    #[must_use]
    pub fn executor(&self) -> Option<Executor<Arc<L>>> {
        self.inner.ready.lock().clone()
    }

    /// Connect using the configured [`StartupPolicy`].
    pub async fn connect(&self) -> Result<()> {
        let startup = &self.inner.config.startup;
        if self
            .connect_with_retry(startup.max_attempts, startup.initial_delay)
            .await
        {
            Ok(())
        } else {
            Err(Error::Lifecycle {
                operation: "connect",
                state: self.state(),
            })
        }
    }

    /// Open the primary client and the pool, retrying failed connects.
    ///
    /// Waits `initial_delay` after the first failure and multiplies the delay
    /// by the startup multiplier after each further one. Returns `false`
    /// instead of an error once `max_attempts` connects have failed; the
    /// layer is then `Failed` and the caller decides whether to exit.
    /// Returns `true` immediately when already `Ready`.
    pub async fn connect_with_retry(&self, max_attempts: u32, initial_delay: Duration) -> bool {
        let _init = self.inner.init.lock().await;

        match self.state() {
            LifecycleState::Ready => return true,
            LifecycleState::Uninitialized | LifecycleState::Connecting => {}
            _ => return false,
        }
        self.transition(&[LifecycleState::Uninitialized], LifecycleState::Connecting);

        let max_attempts = max_attempts.max(1);
        let multiplier = self.inner.config.startup.multiplier;
        let mut delay = initial_delay;

        for attempt in 1..=max_attempts {
            match self.open_primary().await {
                Ok(conn) => {
                    tracing::info!(attempt, "connected to database");
                    return self.finish_startup(conn).await;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "database connection attempt failed"
                    );
                }
            }

            if attempt == max_attempts {
                break;
            }

            tracing::info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "retrying database connection"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.inner.shutdown.triggered() => {
                    tracing::info!("shutdown requested during startup");
                    self.transition(&[LifecycleState::Connecting], LifecycleState::Failed);
                    return false;
                }
            }
            delay = Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier)
                .unwrap_or(Duration::MAX);
        }

        tracing::error!(max_attempts, "could not connect to database, giving up");
        self.transition(&[LifecycleState::Connecting], LifecycleState::Failed);
        false
    }

    async fn open_primary(&self) -> Result<L::Connection> {
        let timeout = self.inner.config.pool.create_timeout;
        let lifecycle = &self.inner.lifecycle;

        let mut conn = tokio::time::timeout(timeout, lifecycle.connect())
            .await
            .map_err(|_| {
                Error::TransientConnection(format!(
                    "connection timeout after {}ms",
                    timeout.as_millis()
                ))
            })?
            .map_err(|e| Error::classify(&e, &self.inner.config.classifier))?;

        if let Err(e) = lifecycle.validate(&mut conn).await {
            if let Err(close_err) = lifecycle.destroy(conn).await {
                tracing::debug!(error = %close_err, "error closing unvalidated connection");
            }
            return Err(Error::classify(&e, &self.inner.config.classifier));
        }
        Ok(conn)
    }

    async fn finish_startup(&self, conn: L::Connection) -> bool {
        let config = &self.inner.config;

        let pool = match Pool::new(config.pool.clone(), Arc::clone(&self.inner.lifecycle)).await {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!(error = %e, "failed to create connection pool");
                if let Err(close_err) = self.inner.lifecycle.destroy(conn).await {
                    tracing::debug!(error = %close_err, "error closing primary connection");
                }
                self.transition(&[LifecycleState::Connecting], LifecycleState::Failed);
                return false;
            }
        };

        let executor = Executor::new(pool, config.retry.clone())
            .with_classifier(Arc::clone(&config.classifier))
            .with_shutdown(self.inner.shutdown.clone());

        *self.inner.primary.lock().await = Some(conn);
        *self.inner.ready.lock() = Some(executor);

        // A shutdown that started meanwhile tears these down once it gets
        // the init lock.
        self.transition(&[LifecycleState::Connecting], LifecycleState::Ready)
    }

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> bool {
        let mut previous = None;
        self.inner.state.send_if_modified(|state| {
            if from.contains(state) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });

        match previous {
            Some(previous) => {
                tracing::info!(from = %previous, %to, "database lifecycle transition");
                true
            }
            None => false,
        }
    }

    async fn ensure_ready(&self, operation: &'static str) -> Result<Executor<Arc<L>>> {
        let state = self.state();
        match state {
            LifecycleState::Ready => {}
            LifecycleState::Uninitialized | LifecycleState::Connecting => {
                let startup = &self.inner.config.startup;
                self.connect_with_retry(startup.max_attempts, startup.initial_delay)
                    .await;
            }
            _ => return Err(Error::Lifecycle { operation, state }),
        }

        self.executor().ok_or_else(|| Error::Lifecycle {
            operation,
            state: self.state(),
        })
    }

    /// Check a connection out of the pool.
    ///
    /// Connects first if the layer is still uninitialized. Fails with
    /// [`Error::Lifecycle`] once shutdown has started.
    pub async fn acquire(&self) -> Result<PooledConnection<Arc<L>>> {
        let executor = self.ensure_ready("acquire").await?;
        executor.pool().get().await.map_err(|e| match e {
            PoolError::Closed => Error::Lifecycle {
                operation: "acquire",
                state: self.state(),
            },
            other => other.into(),
        })
    }

    /// Run `op` against a pooled connection with retries.
    ///
    /// See [`Executor::execute`]. Connects first if the layer is still
    /// uninitialized.
    pub async fn execute<T, E, F>(
        &self,
        op: F,
        policy: Option<&RetryPolicy>,
    ) -> std::result::Result<T, E>
    where
        F: for<'c> FnMut(&'c mut L::Connection) -> BoxFuture<'c, std::result::Result<T, E>>,
        E: fmt::Display + From<Error> + From<PoolError>,
    {
        let executor = self.ensure_ready("execute").await.map_err(E::from)?;
        executor.execute(op, policy).await
    }

    /// Run a health check against the primary client.
    pub async fn check(&self) -> HealthRecord {
        self.inner.monitor.check(self).await
    }

    /// Tear the layer down.
    ///
    /// Runs, in order: refuse new work, wait up to the grace period for
    /// checked-out connections, destroy pooled connections, close the primary
    /// client, move to `Closed`. A failing step is logged and recorded in
    /// the report; later steps still run.
    ///
    /// Only the first call does the work. Concurrent callers wait for it to
    /// finish; calls after `Closed` return at once. Never fails.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut claimed = None;
        self.inner.state.send_if_modified(|state| match state {
            LifecycleState::Draining | LifecycleState::Closed | LifecycleState::Failed => false,
            _ => {
                claimed = Some(*state);
                *state = LifecycleState::Draining;
                true
            }
        });

        let Some(previous_state) = claimed else {
            let state = self.state();
            self.inner.shutdown.trigger();
            if state == LifecycleState::Draining {
                let mut rx = self.subscribe();
                let _ = rx.wait_for(|s| *s == LifecycleState::Closed).await;
            }
            tracing::debug!(%state, "shutdown already handled");
            return ShutdownReport::skipped(state);
        };

        tracing::info!(from = %previous_state, "database shutdown started");

        // Stop retry sleeps and any startup loop still running.
        self.inner.shutdown.trigger();
        let _init = self.inner.init.lock().await;

        let grace = self.inner.config.shutdown_grace;
        let mut failures = Vec::new();

        let executor = self.inner.ready.lock().take();
        let drain = match executor {
            Some(executor) => {
                let report = executor.pool().drain(grace).await;
                if report.abandoned > 0 {
                    let err = Error::ShutdownStep {
                        step: "drain pool",
                        message: format!(
                            "{} connections still checked out after {}ms",
                            report.abandoned,
                            grace.as_millis()
                        ),
                    };
                    tracing::error!(error = %err, "shutdown step failed");
                    failures.push(err);
                }
                if report.failed > 0 {
                    let err = Error::ShutdownStep {
                        step: "destroy pooled connections",
                        message: format!(
                            "{} pooled connections failed to close",
                            report.failed
                        ),
                    };
                    tracing::error!(error = %err, "shutdown step failed");
                    failures.push(err);
                }
                Some(report)
            }
            None => None,
        };

        let primary = self.inner.primary.lock().await.take();
        if let Some(conn) = primary {
            let step = tokio::time::timeout(grace, self.inner.lifecycle.destroy(conn)).await;
            let message = match step {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("timed out after {}ms", grace.as_millis())),
            };
            if let Some(message) = message {
                let err = Error::ShutdownStep {
                    step: "disconnect client",
                    message,
                };
                tracing::error!(error = %err, "shutdown step failed");
                failures.push(err);
            }
        }

        self.inner.state.send_replace(LifecycleState::Closed);
        tracing::info!(
            from = %LifecycleState::Draining,
            to = %LifecycleState::Closed,
            failures = failures.len(),
            "database shutdown complete"
        );

        ShutdownReport {
            performed: true,
            previous_state,
            drain,
            failures,
        }
    }

    /// Run [`Database::shutdown`] once `signal` fires.
    ///
    /// Pair with [`ShutdownSignal::listen_for_termination`] to shut down on
    /// Ctrl-C or SIGTERM. Must be called from within a Tokio runtime.
    pub fn shutdown_on(&self, signal: ShutdownSignal) -> JoinHandle<ShutdownReport> {
        let db = self.clone();
        tokio::spawn(async move {
            signal.triggered().await;
            db.shutdown().await
        })
    }
}

impl<L: ConnectionLifecycle> Clone for Database<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: ConnectionLifecycle> fmt::Debug for Database<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("state", &self.state())
            .field("pool", &self.pool().map(|p| p.status()))
            .finish()
    }
}

#[async_trait]
impl<L: ConnectionLifecycle> HealthProbe for Database<L> {
    async fn probe(&self) -> Result<()> {
        let state = self.state();
        if state != LifecycleState::Ready {
            return Err(Error::Lifecycle {
                operation: "probe",
                state,
            });
        }

        let mut primary = self.inner.primary.lock().await;
        let Some(conn) = primary.as_mut() else {
            return Err(Error::Lifecycle {
                operation: "probe",
                state: self.state(),
            });
        };
        self.inner
            .lifecycle
            .validate(conn)
            .await
            .map_err(|e| Error::classify(&e, &self.inner.config.classifier))
    }

    fn connection_count(&self) -> Option<u32> {
        self.pool().map(|pool| {
            let status = pool.status();
            status.active + status.idle
        })
    }
}
