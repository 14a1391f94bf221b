//! Background maintenance of idle connections.

use std::sync::{Arc, Weak};

use tokio::time::MissedTickBehavior;

use crate::lifecycle::ConnectionLifecycle;
use crate::pool::{PoolInner, Reservation, ReservationKind};

/// Spawn the reaper for `pool`.
///
/// The first tick fires immediately, which warms the pool up to
/// `min_connections`. The task holds only a weak reference. It is never
/// aborted: closing the pool cancels `shutdown`, and the task stops before
/// its next pass or after the connection it is currently closing.
pub(crate) fn spawn<L: ConnectionLifecycle>(pool: &Arc<PoolInner<L>>) {
    let weak: Weak<PoolInner<L>> = Arc::downgrade(pool);
    let shutdown = pool.shutdown.clone();
    let period = pool.config.reap_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(pool) = weak.upgrade() else {
                break;
            };
            if pool.is_closed() {
                break;
            }
            pool.reap().await;
        }

        tracing::trace!("pool reaper stopped");
    });
}

impl<L: ConnectionLifecycle> PoolInner<L> {
    /// Destroy idle connections past `idle_timeout` or `max_uses`, then top
    /// the pool back up to `min_connections`.
    ///
    /// Expired connections are taken one at a time and counted as closing
    /// while their teardown runs, so a drain started meanwhile waits for the
    /// one in flight and tears down the rest itself.
    pub(crate) async fn reap(&self) {
        let idle_timeout = self.config.idle_timeout;
        let max_uses = self.config.max_uses;
        let mut reaped: u64 = 0;

        loop {
            let (entry, reservation) = {
                let mut state = self.state.lock();
                if self.is_closed() {
                    break;
                }
                let Some(position) = state.idle.iter().position(|entry| {
                    entry.metadata.idle_for() >= idle_timeout
                        || entry.metadata.use_count >= max_uses
                }) else {
                    break;
                };
                let Some(entry) = state.idle.remove(position) else {
                    break;
                };
                state.closing += 1;
                (entry, Reservation::new(self, ReservationKind::Closing))
            };

            self.destroy(entry).await;
            drop(reservation);
            reaped += 1;
        }

        if reaped > 0 {
            self.metrics.lock().connections_reaped += reaped;
            tracing::debug!(reaped, "reaped idle connections");
        }

        if let Err(e) = self.ensure_min().await {
            tracing::warn!(error = %e, "failed to replenish pool to minimum size");
        }
    }
}
