use roster_core::ConfigError;
use roster_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Presence failures by the operation that produced them.
///
/// Only `Registration` and `Subscription` ever reach a caller; the rest are
/// logged where they happen and absorbed so timers and feeds keep running.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence registration failed for {login_id}: {source}")]
    Registration {
        login_id: String,
        #[source]
        source: StoreError,
    },
    #[error("heartbeat failed: {0}")]
    Heartbeat(#[source] StoreError),
    #[error("presence status update failed: {0}")]
    StatusUpdate(#[source] StoreError),
    #[error("presence departure failed: {0}")]
    Departure(#[source] StoreError),
    #[error("presence departure timed out after {0:?}")]
    DepartureTimeout(Duration),
    #[error("presence subscription failed: {0}")]
    Subscription(#[source] StoreError),
    #[error("loading online users failed: {0}")]
    List(#[source] StoreError),
}

impl PresenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            PresenceError::Registration { .. } => "registration",
            PresenceError::Heartbeat(_) => "heartbeat",
            PresenceError::StatusUpdate(_) => "status_update",
            PresenceError::Departure(_) | PresenceError::DepartureTimeout(_) => "departure",
            PresenceError::Subscription(_) => "subscription",
            PresenceError::List(_) => "list",
        }
    }

    /// Whether the failure costs the session a capability rather than one beat.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            PresenceError::Registration { .. } | PresenceError::Subscription(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("liveness engine has stopped")]
    Stopped,
    #[error("invalid presence config: {0}")]
    Config(#[from] ConfigError),
}
