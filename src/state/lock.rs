//! Cooperative lock marker shared between processes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Contents of the sentinel lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMarker {
    pub timestamp: DateTime<Utc>,
    pub process_id: u32,
    pub hostname: String,
    /// Random token identifying this acquisition
    #[serde(default = "Uuid::nil")]
    pub token: Uuid,
}

impl LockMarker {
    /// Marker for a fresh acquisition by the current process.
    pub fn acquire(hostname: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            process_id: std::process::id(),
            hostname: hostname.to_string(),
            token: Uuid::new_v4(),
        }
    }

    /// Older than the staleness window: presumed abandoned by a dead holder.
    pub fn is_stale(&self, stale_after: Duration) -> bool {
        Utc::now() - self.timestamp > stale_after
    }

    pub fn holder(&self) -> String {
        format!("pid {} on {}", self.process_id, self.hostname)
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.timestamp
    }
}

/// Proof of a held lock, consumed by `unlock`.
#[derive(Debug)]
pub struct LockHandle {
    pub(crate) token: Uuid,
    pub(crate) holder: String,
    pub(crate) acquired_at: DateTime<Utc>,
}

impl LockHandle {
    pub(crate) fn from_marker(marker: &LockMarker) -> Self {
        Self {
            token: marker.token,
            holder: marker.holder(),
            acquired_at: marker.timestamp,
        }
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

/// Best-effort host identity for lock markers.
pub fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_staleness() {
        let mut marker = LockMarker::acquire("host-a");
        assert!(!marker.is_stale(Duration::minutes(5)));

        marker.timestamp = Utc::now() - Duration::minutes(6);
        assert!(marker.is_stale(Duration::minutes(5)));
    }

    #[test]
    fn test_handle_from_marker() {
        let marker = LockMarker::acquire("host-a");
        let handle = LockHandle::from_marker(&marker);
        assert_eq!(handle.token(), marker.token);
        assert!(handle.holder().contains("host-a"));
    }
}
