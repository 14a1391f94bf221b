//! Health checks.
//!
//! [`HealthMonitor::check`] never fails: every outcome, including a probe
//! that errors or hangs, is reported as a [`HealthRecord`]. The monitor holds
//! no timers; callers poll it on their own cadence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dbkeeper_pool::{ConnectionLifecycle, Pool};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// Whether the probe round-trip succeeded.
    pub healthy: bool,
    /// Wall-clock time spent on the probe.
    pub latency_ms: u64,
    /// Failure description when unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the check finished.
    pub timestamp: DateTime<Utc>,
    /// Open connections (active + idle) when a pool is in use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_count: Option<u32>,
}

impl HealthRecord {
    /// HTTP status a health route should answer with.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        if self.healthy { 200 } else { 503 }
    }
}

/// Something that can be health-checked with a cheap round-trip.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Issue the probe.
    async fn probe(&self) -> Result<()>;

    /// Current number of open connections, if meaningful.
    fn connection_count(&self) -> Option<u32> {
        None
    }
}

#[async_trait]
impl<P: HealthProbe + ?Sized> HealthProbe for Arc<P> {
    async fn probe(&self) -> Result<()> {
        (**self).probe().await
    }

    fn connection_count(&self) -> Option<u32> {
        (**self).connection_count()
    }
}

/// Probes a pooled connection with the lifecycle's validation round-trip.
///
/// A connection that fails the probe is discarded rather than returned.
#[async_trait]
impl<L: ConnectionLifecycle> HealthProbe for Pool<L> {
    async fn probe(&self) -> Result<()> {
        let mut conn = self.get().await?;
        match self.lifecycle().validate(&mut *conn).await {
            Ok(()) => {
                conn.release().await;
                Ok(())
            }
            Err(e) => {
                conn.discard().await;
                Err(Error::from_database(&e))
            }
        }
    }

    fn connection_count(&self) -> Option<u32> {
        let status = self.status();
        Some(status.active + status.idle)
    }
}

/// Produces [`HealthRecord`]s from a [`HealthProbe`].
#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    timeout: Option<Duration>,
}

impl HealthMonitor {
    /// Create a monitor without a probe timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a probe that takes longer than `timeout` as unhealthy.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The probe timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run one health check.
    pub async fn check<P: HealthProbe + ?Sized>(&self, target: &P) -> HealthRecord {
        let started = Instant::now();

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, target.probe()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::TransientConnection(format!(
                    "health check timed out after {}ms",
                    limit.as_millis()
                ))),
            },
            None => target.probe().await,
        };

        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let record = HealthRecord {
            healthy: outcome.is_ok(),
            latency_ms,
            error: outcome.err().map(|e| e.to_string()),
            timestamp: Utc::now(),
            connection_count: target.connection_count(),
        };

        match &record.error {
            None => tracing::debug!(latency_ms, "database health check passed"),
            Some(error) => tracing::warn!(latency_ms, %error, "database health check failed"),
        }
        record
    }
}
