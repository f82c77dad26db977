use std::time::Duration;
use tokio::time::Instant;

/// Tracks liveness of a duplex connection.
///
/// Any inbound frame counts as a sign of life. The connection is considered
/// dead once two heartbeat intervals pass without one.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    last_seen: Instant,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_seen: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record inbound traffic
    pub fn record(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Longest silence tolerated
    pub fn grace(&self) -> Duration {
        self.interval.saturating_mul(2)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) >= self.grace()
    }
}
