use std::time::Duration;

/// Lower bound applied to the reaper sweep interval.
pub const MIN_REAPER_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Wait bound used when a publish does not carry its own timeout.
    pub default_wait_timeout: Duration,
    /// Period between timeout-reaper sweeps.
    pub reaper_interval: Duration,
    /// How long a resolved but never-observed entry is kept for late reads.
    pub resolved_grace: Duration,
    /// How long shutdown waits for in-flight confirms before expiring them.
    pub shutdown_drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout: Duration::from_secs(5),
            reaper_interval: Duration::from_millis(50),
            resolved_grace: Duration::from_secs(1),
            shutdown_drain_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Sweep interval clamped to [`MIN_REAPER_INTERVAL`].
    pub fn effective_reaper_interval(&self) -> Duration {
        self.reaper_interval.max(MIN_REAPER_INTERVAL)
    }
}
