//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a connection [`Pool`](crate::Pool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Minimum number of connections kept open (idle + checked out).
    pub min_connections: u32,

    /// Maximum number of connections, including ones being opened.
    pub max_connections: u32,

    /// Hard deadline for [`Pool::get`](crate::Pool::get).
    pub acquire_timeout: Duration,

    /// Deadline for opening a single new connection, retries included.
    pub create_timeout: Duration,

    /// Idle connections older than this are validated before checkout and
    /// destroyed by the reaper.
    pub idle_timeout: Duration,

    /// How often the reaper scans idle connections.
    pub reap_interval: Duration,

    /// Pause between failed attempts to open a connection.
    pub create_retry_interval: Duration,

    /// Number of checkouts after which a connection is retired.
    pub max_uses: u32,

    /// Whether returned connections are validated before becoming idle.
    pub validate_on_release: bool,

    /// Upper bound for a single validation probe. A probe that does not
    /// answer in time counts as failed.
    pub validation_timeout: Duration,

    /// Upper bound for closing a single connection.
    pub destroy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 5,
            max_connections: 20,
            acquire_timeout: Duration::from_secs(30),
            create_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
            create_retry_interval: Duration::from_secs(2),
            max_uses: 1000,
            validate_on_release: true,
            validation_timeout: Duration::from_secs(5),
            destroy_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the create timeout.
    #[must_use]
    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the reaper interval.
    #[must_use]
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set the pause between failed connection attempts.
    #[must_use]
    pub fn create_retry_interval(mut self, interval: Duration) -> Self {
        self.create_retry_interval = interval;
        self
    }

    /// Set the number of checkouts after which a connection is retired.
    #[must_use]
    pub fn max_uses(mut self, uses: u32) -> Self {
        self.max_uses = uses;
        self
    }

    /// Enable or disable validation on release.
    #[must_use]
    pub fn validate_on_release(mut self, enabled: bool) -> Self {
        self.validate_on_release = enabled;
        self
    }

    /// Set the validation probe timeout.
    #[must_use]
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Set the connection close timeout.
    #[must_use]
    pub fn destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = timeout;
        self
    }

    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Configuration(
                "max_connections must be greater than zero".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Configuration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.max_uses == 0 {
            return Err(PoolError::Configuration(
                "max_uses must be greater than zero".into(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(PoolError::Configuration(
                "reap_interval must be greater than zero".into(),
            ));
        }
        if self.validation_timeout.is_zero() || self.destroy_timeout.is_zero() {
            return Err(PoolError::Configuration(
                "validation_timeout and destroy_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.create_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.reap_interval, Duration::from_secs(60));
        assert_eq!(config.create_retry_interval, Duration::from_secs(2));
        assert_eq!(config.max_uses, 1000);
        assert_eq!(config.validation_timeout, Duration::from_secs(5));
        assert_eq!(config.destroy_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let config = PoolConfig::new().min_connections(10).max_connections(5);
        assert!(matches!(
            config.validate(),
            Err(PoolError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(PoolConfig::new().min_connections(0).max_connections(0).validate().is_err());
        assert!(PoolConfig::new().max_uses(0).validate().is_err());
        assert!(PoolConfig::new().reap_interval(Duration::ZERO).validate().is_err());
        assert!(PoolConfig::new().validation_timeout(Duration::ZERO).validate().is_err());
        assert!(PoolConfig::new().destroy_timeout(Duration::ZERO).validate().is_err());
    }
}
