//! Shutdown signalling.

use tokio_util::sync::CancellationToken;

/// Broadcast flag telling background work to stop.
///
/// Cloning is cheap; all clones observe the same trigger. Sleeps in the
/// executor and the startup connect loop end early once it fires.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Create an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the signal fires.
    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// The underlying cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fire this signal when the process receives Ctrl-C or, on Unix,
    /// SIGTERM.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen_for_termination(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = wait_for_termination() => {
                    tracing::info!("termination signal received");
                    signal.trigger();
                }
                () = signal.triggered() => {}
            }
        });
    }
}

async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
