use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity has no login id or email to key its presence record")]
    MissingKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeat,
    #[error("inactive threshold {threshold_ms}ms must be larger than heartbeat interval {interval_ms}ms")]
    ThresholdNotAboveInterval { threshold_ms: u128, interval_ms: u128 },
    #[error("sweep interval must be greater than zero")]
    ZeroSweep,
}
