//! Lifecycle states of the database layer.
//!
//! ```text
//! Uninitialized -> Connecting -> Ready -> Draining -> Closed
//!                       |
//!                       +-> Failed
//! ```
//!
//! Transitions happen at runtime from many tasks at once, so the state is a
//! plain enum published through a `watch` channel rather than a type
//! parameter.

use std::fmt;

/// Current phase of a [`Database`](crate::Database).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    /// Nothing has been opened yet.
    #[default]
    Uninitialized,
    /// The startup connect loop is running.
    Connecting,
    /// Connected; the pool accepts work.
    Ready,
    /// Shutdown in progress; new work is refused.
    Draining,
    /// Shutdown finished.
    Closed,
    /// Startup gave up after exhausting its attempts.
    Failed,
}

impl LifecycleState {
    /// Whether no further transition can leave this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether the layer accepts new work in this state.
    #[must_use]
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Connecting | Self::Ready)
    }

    /// Lowercase name used in logs and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
