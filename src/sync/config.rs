//! Synchronization loop configuration.

use std::time::Duration;

use chrono::TimeDelta;

use crate::state::DEFAULT_LOCK_TIMEOUT;

/// Timing for the heartbeat and sync loops.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between heartbeats (default: 10s)
    pub heartbeat_interval: Duration,
    /// Interval between state reloads (default: 5s)
    pub sync_interval: Duration,
    /// Bounded wait for the state lock (default: 5s)
    pub lock_timeout: Duration,
    /// Age of the last successful sync past which the manager is unhealthy (default: 60s)
    pub stale_sync_after: Duration,
    /// Missed heartbeats before a bot is INACTIVE (default: 3)
    pub inactive_after_missed: u32,
    /// Missed heartbeats before a bot is DEAD (default: 6)
    pub dead_after_missed: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            sync_interval: Duration::from_secs(5),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_sync_after: Duration::from_secs(60),
            inactive_after_missed: 3,
            dead_after_missed: 6,
        }
    }
}

impl SyncConfig {
    pub fn inactive_after(&self) -> TimeDelta {
        missed(self.heartbeat_interval, self.inactive_after_missed)
    }

    pub fn dead_after(&self) -> TimeDelta {
        missed(self.heartbeat_interval, self.dead_after_missed)
    }

    pub fn stale_sync_window(&self) -> TimeDelta {
        TimeDelta::from_std(self.stale_sync_after).unwrap_or(TimeDelta::MAX)
    }
}

fn missed(interval: Duration, count: u32) -> TimeDelta {
    interval
        .checked_mul(count)
        .and_then(|d| TimeDelta::from_std(d).ok())
        .unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_windows() {
        let config = SyncConfig::default();
        assert_eq!(config.inactive_after(), TimeDelta::seconds(30));
        assert_eq!(config.dead_after(), TimeDelta::seconds(60));
        assert_eq!(config.stale_sync_window(), TimeDelta::seconds(60));
    }

    #[test]
    fn test_oversized_windows_saturate() {
        let config = SyncConfig {
            heartbeat_interval: Duration::MAX,
            stale_sync_after: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(config.inactive_after(), TimeDelta::MAX);
        assert_eq!(config.stale_sync_window(), TimeDelta::MAX);
    }
}
