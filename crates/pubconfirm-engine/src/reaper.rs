use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::registry::CorrelationRegistry;

/// Result of one reaper sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending entries resolved as `TimedOut` by this sweep.
    pub expired: usize,
    /// Resolved, unobserved entries dropped after their grace period.
    pub purged: usize,
}

/// Background sweep that expires entries past their deadline.
///
/// Losing the race to the confirm listener is expected: the registry simply
/// reports that the entry was already resolved.
pub struct TimeoutReaper {
    registry: Arc<CorrelationRegistry>,
    interval: Duration,
    resolved_grace: Duration,
}

impl TimeoutReaper {
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        interval: Duration,
        resolved_grace: Duration,
    ) -> Self {
        Self {
            registry,
            interval,
            resolved_grace,
        }
    }

    /// Runs one sweep as of `now`.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let expired = self.registry.expire_overdue(now);
        let purged = self.registry.purge_settled(now, self.resolved_grace);
        if expired > 0 {
            self.registry.stats().record_reaped(expired);
        }
        if expired > 0 || purged > 0 {
            debug!(expired, purged, "reaper sweep");
        }
        SweepReport { expired, purged }
    }

    /// Sweeps every `interval` until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }
    }
}
