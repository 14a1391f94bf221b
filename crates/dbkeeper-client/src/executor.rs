//! Retrying execution of database operations.
//!
//! An operation is attempted up to `max_retries + 1` times. After each
//! failure the error is classified; fatal errors are returned untouched,
//! transient ones are retried after the policy's backoff delay. Every retry
//! emits one `warn` event carrying `attempt`, `delay_ms` and `error`.

use std::fmt;
use std::sync::Arc;

use dbkeeper_pool::{ConnectionLifecycle, Pool, PoolError};
use dbkeeper_retry::{ErrorClassifier, RetryPolicy};
use futures_util::future::BoxFuture;

use crate::shutdown::ShutdownSignal;

/// Message of the warning logged before each retry.
pub const RETRY_WARNING: &str = "transient database error, retrying";

/// Runs operations against pooled connections, retrying transient failures.
///
/// # Example
///
/// ```rust,ignore
/// let executor = Executor::new(pool, RetryPolicy::default());
///
/// let count: i64 = executor
///     .execute(|conn| Box::pin(async move { conn.count_users().await }), None)
///     .await?;
/// ```
pub struct Executor<L: ConnectionLifecycle> {
    pool: Pool<L>,
    policy: RetryPolicy,
    classifier: Arc<ErrorClassifier>,
    shutdown: Option<ShutdownSignal>,
}

impl<L: ConnectionLifecycle> Executor<L> {
    /// Create an executor using the default error classifier.
    #[must_use]
    pub fn new(pool: Pool<L>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            classifier: Arc::new(ErrorClassifier::default()),
            shutdown: None,
        }
    }

    /// Use a custom classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Stop waiting between retries once `signal` fires.
    ///
    /// The attempt in flight is not interrupted; the executor simply does not
    /// start another one and returns the last error instead.
    #[must_use]
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    /// The pool connections are drawn from.
    #[must_use]
    pub fn pool(&self) -> &Pool<L> {
        &self.pool
    }

    /// The default retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The classifier deciding which errors are retried.
    #[must_use]
    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Run `op` against a pooled connection, retrying transient failures.
    ///
    /// Each attempt acquires a connection, runs `op` on it and returns the
    /// connection to the pool whatever the outcome. Acquire failures count
    /// as attempts too; [`PoolError::Exhausted`] is retryable by default.
    ///
    /// `policy` overrides the executor's policy for this call.
    pub async fn execute<T, E, F>(&self, mut op: F, policy: Option<&RetryPolicy>) -> Result<T, E>
    where
        F: for<'c> FnMut(&'c mut L::Connection) -> BoxFuture<'c, Result<T, E>>,
        E: fmt::Display + From<PoolError>,
    {
        let policy = policy.unwrap_or(&self.policy);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let result = match self.pool.get().await {
                Ok(mut conn) => {
                    let result = op(&mut *conn).await;
                    conn.release().await;
                    result
                }
                Err(e) => Err(E::from(e)),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "database operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !pause_before_retry(
                        attempt,
                        &e,
                        policy,
                        &self.classifier,
                        self.shutdown.as_ref(),
                    )
                    .await
                    {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl<L: ConnectionLifecycle> Clone for Executor<L> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            policy: self.policy.clone(),
            classifier: Arc::clone(&self.classifier),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<L: ConnectionLifecycle> fmt::Debug for Executor<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("pool", &self.pool)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Retry an arbitrary async operation.
///
/// `op` receives the 1-based attempt number. Semantics match
/// [`Executor::execute`] without the pool.
///
/// # Example
///
/// ```rust,ignore
/// let rows = retry(&RetryPolicy::default(), &ErrorClassifier::default(), |_| {
///     client.query("SELECT 1")
/// })
/// .await?;
/// ```
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    classifier: &ErrorClassifier,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !pause_before_retry(attempt, &e, policy, classifier, None).await {
                    return Err(e);
                }
            }
        }
    }
}

/// Decide whether attempt `attempt` should be followed by another, sleeping
/// the backoff delay if so.
async fn pause_before_retry<E: fmt::Display + ?Sized>(
    attempt: u32,
    error: &E,
    policy: &RetryPolicy,
    classifier: &ErrorClassifier,
    shutdown: Option<&ShutdownSignal>,
) -> bool {
    if !classifier.is_retryable(error) {
        tracing::debug!(attempt, error = %error, "non-retryable database error");
        return false;
    }
    if attempt > policy.max_retries {
        tracing::error!(
            attempts = attempt,
            error = %error,
            "database operation failed after exhausting retries"
        );
        return false;
    }
    if shutdown.is_some_and(ShutdownSignal::is_triggered) {
        return false;
    }

    let delay = policy.delay(attempt);
    tracing::warn!(
        attempt,
        max_retries = policy.max_retries,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        error = %error,
        "{RETRY_WARNING}"
    );

    match shutdown {
        Some(signal) => {
            tokio::select! {
                () = tokio::time::sleep(delay) => true,
                () = signal.triggered() => {
                    tracing::info!(attempt, "shutdown requested, abandoning retries");
                    false
                }
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(10))
            .jitter_max(Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_attempts_n_plus_one_times() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> =
            retry(&fast_policy(3), &ErrorClassifier::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("connection refused".to_string()) }
            })
            .await;

        assert_eq!(result, Err("connection refused".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> =
            retry(&fast_policy(3), &ErrorClassifier::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("unique constraint violation") }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_passes_attempt_number() {
        let result: Result<u32, &str> =
            retry(&fast_policy(5), &ErrorClassifier::default(), |attempt| async move {
                if attempt < 3 {
                    Err("connection timeout")
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_backoff() {
        let policy = RetryPolicy::new()
            .max_retries(2)
            .initial_delay(Duration::from_millis(100))
            .jitter_max(Duration::ZERO);
        let started = tokio::time::Instant::now();

        let _: Result<(), &str> = retry(&policy, &ErrorClassifier::default(), |_| async {
            Err("socket hang up")
        })
        .await;

        // 100ms + 200ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_retrying() {
        let signal = ShutdownSignal::new();
        let classifier = ErrorClassifier::default();
        let policy = fast_policy(3);

        assert!(pause_before_retry(1, "connection reset", &policy, &classifier, Some(&signal)).await);

        signal.trigger();
        assert!(!pause_before_retry(1, "connection reset", &policy, &classifier, Some(&signal)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_respects_max_retries() {
        let classifier = ErrorClassifier::default();
        let policy = fast_policy(2);

        assert!(pause_before_retry(2, "connection reset", &policy, &classifier, None).await);
        assert!(!pause_before_retry(3, "connection reset", &policy, &classifier, None).await);
        assert!(!pause_before_retry(1, "syntax error", &policy, &classifier, None).await);
    }

    proptest! {
        #[test]
        fn prop_transient_failure_attempted_n_plus_one(max_retries in 0u32..8) {
            let policy = RetryPolicy::new()
                .max_retries(max_retries)
                .initial_delay(Duration::ZERO)
                .max_delay(Duration::ZERO)
                .jitter_max(Duration::ZERO);
            let calls = AtomicU32::new(0);

            let result: Result<(), &str> = tokio_test::block_on(retry(
                &policy,
                &ErrorClassifier::default(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("connection reset by peer") }
                },
            ));

            prop_assert!(result.is_err());
            prop_assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
        }
    }
}
