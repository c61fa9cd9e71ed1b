use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Period between two liveness refreshes of the local record.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
/// Age after which a record is no longer considered live, whatever its flag says.
pub const INACTIVE_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: RecordId,
    pub username: String,
    pub email: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    /// Time elapsed since the last refresh. A `last_seen` ahead of `now`
    /// (clock skew between writers) counts as zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let age = now.signed_duration_since(self.last_seen);
        if age < Duration::zero() {
            Duration::zero()
        } else {
            age
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        if !self.is_online {
            return false;
        }
        match Duration::from_std(threshold) {
            Ok(threshold) => self.age(now) < threshold,
            Err(_) => true,
        }
    }

    pub fn apply(&mut self, patch: &PresencePatch) {
        if let Some(is_online) = patch.is_online {
            self.is_online = is_online;
        }
        if let Some(last_seen) = patch.last_seen {
            self.last_seen = last_seen;
        }
    }
}

/// Fields of a record before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPresence {
    pub username: String,
    pub email: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

impl NewPresence {
    pub fn online(username: impl Into<String>, email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            is_online: true,
            last_seen: now,
        }
    }

    pub fn into_record(self, id: RecordId) -> PresenceRecord {
        PresenceRecord {
            id,
            username: self.username,
            email: self.email,
            is_online: self.is_online,
            last_seen: self.last_seen,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl PresencePatch {
    /// Heartbeat and resume both write this shape.
    pub fn touch(now: DateTime<Utc>) -> Self {
        Self::status(true, now)
    }

    pub fn status(is_online: bool, now: DateTime<Utc>) -> Self {
        Self {
            is_online: Some(is_online),
            last_seen: Some(now),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_online.is_none() && self.last_seen.is_none()
    }
}

/// Conjunction of equality predicates. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub email: Option<String>,
    pub username: Option<String>,
    pub is_online: Option<bool>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Self::default()
        }
    }

    pub fn online() -> Self {
        Self {
            is_online: Some(true),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &PresenceRecord) -> bool {
        if let Some(email) = &self.email {
            if &record.email != email {
                return false;
            }
        }
        if let Some(username) = &self.username {
            if &record.username != username {
                return false;
            }
        }
        if let Some(is_online) = self.is_online {
            if record.is_online != is_online {
                return false;
            }
        }
        true
    }
}

/// Keeps the live records of a snapshot, ordered by username then id.
pub fn filter_active(
    records: &[PresenceRecord],
    now: DateTime<Utc>,
    threshold: std::time::Duration,
) -> Vec<PresenceRecord> {
    let mut active: Vec<PresenceRecord> = records
        .iter()
        .filter(|record| record.is_live(now, threshold))
        .cloned()
        .collect();
    sort_roster(&mut active);
    active
}

pub fn sort_roster(records: &mut [PresenceRecord]) {
    records.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.id.cmp(&b.id)));
}
