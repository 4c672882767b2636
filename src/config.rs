//! Session tuning knobs.

use std::time::Duration;

/// Quiet period after the last access before the link is closed on purpose.
pub const IDLE_DISCONNECT_SECS: u64 = 120;

/// Configuration for a [`crate::CandleSession`]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period before the graceful idle disconnect
    pub idle_disconnect: Duration,
    /// Connect-with-retry budget per `ensure_connected`
    pub connect_attempts: u8,
    /// Bound on a single attempt: connect, service discovery and identity reads
    pub connect_timeout: Duration,
    /// Pause between connect attempts
    pub retry_delay: Duration,
    /// While the light is off, re-read the battery every Nth refresh
    pub battery_cadence: u32,
    /// Consecutive failures after which hosts are advised to back off
    pub failure_threshold: u32,
    /// Device timer slot used for arm/disarm frames
    pub timer_channel: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_disconnect: Duration::from_secs(IDLE_DISCONNECT_SECS),
            connect_attempts: 3,
            connect_timeout: Duration::from_secs(20),
            retry_delay: Duration::from_millis(500),
            battery_cadence: 10,
            failure_threshold: 10,
            timer_channel: 0,
        }
    }
}
