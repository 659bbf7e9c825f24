use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the publisher, listener, reaper, and registry.
#[derive(Debug, Default)]
pub struct EngineStats {
    published: AtomicU64,
    send_failed: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    timed_out: AtomicU64,
    duplicate_resolutions: AtomicU64,
    unknown_signals: AtomicU64,
    evicted: AtomicU64,
    reaped: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    /// Publishes handed to the transport successfully.
    pub published: u64,
    /// Publishes rejected synchronously (or refused after shutdown).
    pub send_failed: u64,
    pub acked: u64,
    pub nacked: u64,
    pub timed_out: u64,
    /// Resolution attempts for an already-resolved id.
    pub duplicate_resolutions: u64,
    /// Confirms for ids the registry no longer (or never) tracked.
    pub unknown_signals: u64,
    pub evicted: u64,
    /// Entries expired by the timeout reaper.
    pub reaped: u64,
}

impl EngineStats {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failed(&self) {
        self.send_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_nacked(&self) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate_resolution(&self) {
        self.duplicate_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unknown_signal(&self) {
        self.unknown_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reaped(&self, count: usize) {
        self.reaped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            send_failed: self.send_failed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            duplicate_resolutions: self.duplicate_resolutions.load(Ordering::Relaxed),
            unknown_signals: self.unknown_signals.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}

impl EngineStatsSnapshot {
    /// Publishes that reached a terminal outcome.
    pub fn resolved(&self) -> u64 {
        self.acked + self.nacked + self.timed_out
    }
}
