//! Structured logging setup.
//!
//! Production emits one JSON object per line; every other environment gets
//! the human-readable formatter. `RUST_LOG` takes precedence over the
//! configured level when set.

use tracing_subscriber::EnvFilter;

use crate::config::{Environment, Settings};

/// Install the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed, which is normal in
/// tests and when an application configures logging itself.
pub fn init(level: &str, environment: Environment) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if environment.is_production() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::debug!(%environment, level, "logging initialized");
    }
    installed
}

/// Install the global subscriber described by `settings`.
pub fn init_from_settings(settings: &Settings) -> bool {
    init(&settings.log_level, settings.environment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_tolerated() {
        // A malformed level falls back to `info` instead of failing.
        let _ = init("not a valid [filter", Environment::Test);
        assert!(!init("debug", Environment::Production));
    }
}
