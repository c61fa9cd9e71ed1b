use crate::presence::{filter_active, PresenceRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const INIT_FAILED_MESSAGE: &str = "Failed to initialize user presence";
pub const LOAD_FAILED_MESSAGE: &str = "Failed to load online users";
pub const SUBSCRIBE_FAILED_MESSAGE: &str = "Failed to subscribe to presence updates";

/// What the view layer reads. Published as a whole value so readers never
/// observe a half-applied update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceView {
    pub online_users: Vec<PresenceRecord>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl Default for PresenceView {
    fn default() -> Self {
        Self::loading()
    }
}

impl PresenceView {
    pub fn loading() -> Self {
        Self {
            online_users: Vec::new(),
            is_loading: true,
            error: None,
        }
    }

    pub fn idle() -> Self {
        Self {
            online_users: Vec::new(),
            is_loading: false,
            error: None,
        }
    }

    pub fn ready(online_users: Vec<PresenceRecord>) -> Self {
        Self {
            online_users,
            is_loading: false,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            online_users: Vec::new(),
            is_loading: false,
            error: Some(message.into()),
        }
    }

    pub fn state(&self) -> ViewState {
        if self.error.is_some() {
            ViewState::Error
        } else if self.is_loading {
            ViewState::Loading
        } else {
            ViewState::Ready
        }
    }

    /// Re-applies the staleness predicate at read time.
    pub fn online_users_at(
        &self,
        now: DateTime<Utc>,
        threshold: std::time::Duration,
    ) -> Vec<PresenceRecord> {
        filter_active(&self.online_users, now, threshold)
    }

    pub fn contains_login(&self, login_id: &str) -> bool {
        self.online_users.iter().any(|user| user.email == login_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Loading,
    Ready,
    Error,
}
