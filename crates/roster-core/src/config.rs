use crate::error::ConfigError;
use crate::presence::{HEARTBEAT_INTERVAL, INACTIVE_THRESHOLD};
use std::time::Duration;

pub const DEFAULT_DEPARTURE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub inactive_threshold: Duration,
    /// Upper bound on the best-effort delete issued on departure.
    pub departure_timeout: Duration,
    /// How often the reconciler re-filters its last snapshot with no new events.
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            inactive_threshold: INACTIVE_THRESHOLD,
            departure_timeout: DEFAULT_DEPARTURE_TIMEOUT,
            sweep_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl PresenceConfig {
    pub fn with_intervals(heartbeat_interval: Duration, inactive_threshold: Duration) -> Self {
        Self {
            heartbeat_interval,
            inactive_threshold,
            sweep_interval: heartbeat_interval,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweep);
        }
        if self.inactive_threshold <= self.heartbeat_interval {
            return Err(ConfigError::ThresholdNotAboveInterval {
                threshold_ms: self.inactive_threshold.as_millis(),
                interval_ms: self.heartbeat_interval.as_millis(),
            });
        }
        Ok(())
    }

    /// Number of consecutive beats that can be missed before the record ages out.
    pub fn tolerated_misses(&self) -> u32 {
        if self.heartbeat_interval.is_zero() {
            return 0;
        }
        let ratio = self.inactive_threshold.as_nanos() / self.heartbeat_interval.as_nanos();
        u32::try_from(ratio.saturating_sub(1)).unwrap_or(u32::MAX)
    }
}
