//! Connection pool integration tests.
//!
//! All tests run on a paused clock, so timeouts and reaper ticks are
//! deterministic.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use dbkeeper_pool::{Pool, PoolConfig, PoolError};
use dbkeeper_testing::MockLifecycle;
use tokio::time::{Instant, sleep};

fn config() -> PoolConfig {
    PoolConfig::new()
        .min_connections(0)
        .max_connections(2)
        .acquire_timeout(Duration::from_millis(100))
}

// =============================================================================
// Acquire
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_third_acquire_is_exhausted() {
    let pool = Pool::new(config(), MockLifecycle::new()).await.unwrap();

    let started = Instant::now();
    let (a, b, c) = tokio::join!(pool.get(), pool.get(), pool.get());
    let elapsed = started.elapsed();

    let results = [a, b, c];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(PoolError::Exhausted { .. })))
        .count();
    assert_eq!((ok, exhausted), (2, 1));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150));

    // The timed-out caller left the wait queue.
    let status = pool.status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.active, 2);
    assert_eq!(pool.metrics().checkouts_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_message_is_retryable() {
    let pool = Pool::new(config().max_connections(1), MockLifecycle::new())
        .await
        .unwrap();
    let _held = pool.get().await.unwrap();

    let err = pool.get().await.unwrap_err();
    assert!(err.is_exhausted());
    assert!(dbkeeper_retry::is_retryable(&err));
}

#[tokio::test(start_paused = true)]
async fn test_waiter_gets_released_connection() {
    let pool = Pool::new(
        config().max_connections(1).acquire_timeout(Duration::from_secs(1)),
        MockLifecycle::new(),
    )
    .await
    .unwrap();

    let held = pool.get().await.unwrap();
    let id = held.metadata().id;

    let releaser = tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        held.release().await;
    });

    let conn = pool.get().await.unwrap();
    assert_eq!(conn.metadata().id, id);
    releaser.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_acquire_leaves_no_trace() {
    let pool = Pool::new(config().max_connections(1), MockLifecycle::new())
        .await
        .unwrap();
    let _held = pool.get().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(10), pool.get()).await;
    assert!(outcome.is_err());

    let status = pool.status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.creating, 0);
    assert_eq!(status.active, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_checkouts_never_exceed_max() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(
        config()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5)),
        lifecycle.clone(),
    )
    .await
    .unwrap();

    let mut tasks = Vec::new();
    for i in 0..20u64 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool.get().await.unwrap();
            let status = pool.status();
            assert!(status.active <= 4);
            assert!(status.total() <= 4);
            sleep(Duration::from_millis(10 + i)).await;
            conn.release().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(lifecycle.connects() <= 4);
    assert_eq!(pool.status().active, 0);
    assert_eq!(pool.metrics().checkouts_successful, 20);
}

// =============================================================================
// Creation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_retries_until_connect_succeeds() {
    let lifecycle = MockLifecycle::new();
    lifecycle.refuse_next_connects(2);

    let pool = Pool::new(
        PoolConfig::new()
            .min_connections(0)
            .create_retry_interval(Duration::from_millis(100))
            .create_timeout(Duration::from_secs(1)),
        lifecycle.clone(),
    )
    .await
    .unwrap();

    let started = Instant::now();
    let conn = pool.get().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(lifecycle.connects(), 3);
    assert_eq!(conn.id(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_gives_up_with_last_error() {
    let lifecycle = MockLifecycle::new();
    lifecycle.set_down(true);

    let pool = Pool::new(
        PoolConfig::new()
            .min_connections(0)
            .create_retry_interval(Duration::from_millis(100))
            .create_timeout(Duration::from_millis(500)),
        lifecycle.clone(),
    )
    .await
    .unwrap();

    let err = pool.get().await.unwrap_err();
    assert!(matches!(err, PoolError::Connection(_)));
    assert!(err.to_string().contains("ECONNREFUSED"));
    assert!(lifecycle.connects() > 1);
    assert_eq!(pool.status().total(), 0);
}

// =============================================================================
// Minimum size, validation and retirement
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_warm_up_reaches_minimum() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(
        PoolConfig::new().min_connections(3).max_connections(5),
        lifecycle.clone(),
    )
    .await
    .unwrap();

    pool.warm_up().await.unwrap();
    sleep(Duration::from_millis(10)).await;

    let status = pool.status();
    assert_eq!(status.idle, 3);
    assert_eq!(status.total(), 3);

    let a = pool.get().await.unwrap();
    let b = pool.get().await.unwrap();
    let status = pool.status();
    assert!(status.active + status.idle >= 3);
    a.release().await;
    b.release().await;

    let status = pool.status();
    assert!(status.active + status.idle >= 3);
    assert_eq!(lifecycle.open_connections(), status.total());
}

#[tokio::test(start_paused = true)]
async fn test_stale_idle_connection_is_validated() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(
        config().idle_timeout(Duration::from_secs(1)),
        lifecycle.clone(),
    )
    .await
    .unwrap();

    pool.get().await.unwrap().release().await;
    let validates = lifecycle.validates();

    // Fresh: handed out without a probe.
    pool.get().await.unwrap().release().await;
    // Only the release-time validation ran.
    assert_eq!(lifecycle.validates(), validates + 1);

    sleep(Duration::from_secs(2)).await;
    lifecycle.set_fail_validation(true);

    let conn = pool.get().await.unwrap();
    assert_eq!(conn.id(), 2, "stale connection should have been replaced");

    // The stale connection is closed in the background.
    sleep(Duration::from_millis(1)).await;
    assert_eq!(lifecycle.destroys(), 1);

    lifecycle.set_fail_validation(false);
    conn.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_hung_stale_validation_respects_acquire_deadline() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(
        config()
            .max_connections(1)
            .idle_timeout(Duration::from_secs(1)),
        lifecycle.clone(),
    )
    .await
    .unwrap();

    pool.get().await.unwrap().release().await;
    sleep(Duration::from_secs(2)).await;
    lifecycle.set_hang_validation(true);

    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(60), pool.get()).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Ok(Err(PoolError::Exhausted { .. }))));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150));

    // The unresponsive connection is closed in the background and its slot
    // is freed.
    sleep(Duration::from_millis(10)).await;
    assert_eq!(lifecycle.destroys(), 1);
    assert_eq!(pool.status().total(), 0);
    assert_eq!(pool.metrics().validations_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_release_validation_is_bounded() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(
        config().validation_timeout(Duration::from_millis(200)),
        lifecycle.clone(),
    )
    .await
    .unwrap();

    let conn = pool.get().await.unwrap();
    lifecycle.set_hang_validation(true);

    let started = Instant::now();
    let returned = tokio::time::timeout(Duration::from_secs(600), conn.release()).await;
    let elapsed = started.elapsed();

    assert!(returned.is_ok());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(300));
    assert_eq!(lifecycle.destroys(), 1);
    assert_eq!(lifecycle.open_connections(), 0);
    assert_eq!(pool.status().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_max_uses_retires_connection() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(config().max_connections(1).max_uses(2), lifecycle.clone())
        .await
        .unwrap();

    let conn = pool.get().await.unwrap();
    assert_eq!(conn.id(), 1);
    conn.release().await;

    let conn = pool.get().await.unwrap();
    assert_eq!(conn.metadata().use_count, 2);
    conn.release().await;
    assert_eq!(lifecycle.destroys(), 1);

    let conn = pool.get().await.unwrap();
    assert_eq!(conn.id(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_return_is_replaced_up_to_minimum() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(
        PoolConfig::new().min_connections(1).max_connections(2),
        lifecycle.clone(),
    )
    .await
    .unwrap();
    pool.warm_up().await.unwrap();

    let conn = pool.get().await.unwrap();
    lifecycle.set_fail_validation(true);
    conn.release().await;
    lifecycle.set_fail_validation(false);

    // Replacement runs in the background.
    sleep(Duration::from_millis(10)).await;

    assert_eq!(lifecycle.destroys(), 1);
    let status = pool.status();
    assert_eq!(status.idle, 1);
    assert_eq!(lifecycle.open_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_destroys_idle_and_keeps_minimum() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(
        PoolConfig::new()
            .min_connections(1)
            .max_connections(3)
            .idle_timeout(Duration::from_secs(1))
            .reap_interval(Duration::from_millis(500)),
        lifecycle.clone(),
    )
    .await
    .unwrap();

    let (a, b, c) = tokio::join!(pool.get(), pool.get(), pool.get());
    for conn in [a, b, c] {
        conn.unwrap().release().await;
    }
    assert_eq!(pool.status().idle, 3);

    sleep(Duration::from_millis(2_250)).await;

    let status = pool.status();
    assert_eq!(status.total(), 1);
    assert!(pool.metrics().connections_reaped >= 3);
    assert_eq!(lifecycle.open_connections(), 1);
}

// =============================================================================
// Close and drain
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_wakes_waiters() {
    let pool = Pool::new(
        config().max_connections(1).acquire_timeout(Duration::from_secs(10)),
        MockLifecycle::new(),
    )
    .await
    .unwrap();
    let _held = pool.get().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await })
    };
    sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.status().pending, 1);

    pool.close().await;
    assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn test_drain_waits_for_checked_out() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(config(), lifecycle.clone()).await.unwrap();

    let (a, b) = tokio::join!(pool.get(), pool.get());
    let a = a.unwrap();
    b.unwrap().release().await;

    let releaser = tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        a.release().await;
    });

    let report = pool.drain(Duration::from_secs(1)).await;
    releaser.await.unwrap();

    assert_eq!(report.destroyed, 1);
    assert_eq!(report.abandoned, 0);
    assert_eq!(lifecycle.open_connections(), 0);
    assert!(matches!(pool.get().await, Err(PoolError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn test_drain_waits_for_reaper_in_flight() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(
        PoolConfig::new()
            .min_connections(0)
            .max_connections(3)
            .idle_timeout(Duration::from_secs(1))
            .reap_interval(Duration::from_millis(500)),
        lifecycle.clone(),
    )
    .await
    .unwrap();

    let (a, b, c) = tokio::join!(pool.get(), pool.get(), pool.get());
    for conn in [a, b, c] {
        conn.unwrap().release().await;
    }
    lifecycle.set_destroy_delay(Duration::from_secs(1));

    // The reaper starts closing the first expired connection at 1s.
    sleep(Duration::from_millis(1_200)).await;
    assert_eq!(pool.status().closing, 1);

    let report = pool.drain(Duration::from_secs(5)).await;

    assert_eq!(report.destroyed, 2);
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(lifecycle.destroys(), 3);
    assert_eq!(lifecycle.open_connections(), 0);
    assert_eq!(pool.status().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_drain_bounds_hung_close() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(
        config().destroy_timeout(Duration::from_millis(100)),
        lifecycle.clone(),
    )
    .await
    .unwrap();
    pool.get().await.unwrap().release().await;
    lifecycle.set_destroy_delay(Duration::from_secs(3_600));

    let started = Instant::now();
    let report = pool.drain(Duration::from_secs(1)).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.destroyed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(pool.metrics().connections_closed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_drain_reports_abandoned() {
    let lifecycle = MockLifecycle::new();
    let pool = Pool::new(config(), lifecycle.clone()).await.unwrap();
    let held = pool.get().await.unwrap();

    let started = Instant::now();
    let report = pool.drain(Duration::from_millis(100)).await;
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(report.abandoned, 1);

    // Returned after the drain: closed instead of pooled.
    held.release().await;
    assert_eq!(lifecycle.open_connections(), 0);
    assert_eq!(pool.status().total(), 0);
}
