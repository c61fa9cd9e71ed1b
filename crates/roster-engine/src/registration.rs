use crate::error::PresenceError;
use chrono::{DateTime, Utc};
use roster_core::{Identity, NewPresence, PresencePatch, PresenceRecord, RecordFilter};
use roster_store::RecordStore;
use tracing::{info, warn};

/// Finds the identity's record by natural key and marks it online, or
/// creates one. Looking up first is what keeps one record per identity,
/// since the store itself does not enforce it.
pub async fn register_or_resume(
    store: &dyn RecordStore,
    identity: &Identity,
    now: DateTime<Utc>,
) -> Result<PresenceRecord, PresenceError> {
    let failed = |source| PresenceError::Registration {
        login_id: identity.login_id.clone(),
        source,
    };

    let existing = store
        .list(&RecordFilter::by_email(identity.login_id.as_str()))
        .await
        .map_err(failed)?;

    if let Some(current) = freshest(&existing) {
        if existing.len() > 1 {
            warn!(
                event = "duplicate_presence",
                login_id = %identity.login_id,
                count = existing.len(),
                resumed = %current.id
            );
        }
        match store.update(&current.id, PresencePatch::touch(now)).await {
            Ok(record) => {
                info!(event = "presence_resumed", id = %record.id, login_id = %identity.login_id);
                return Ok(record);
            }
            // Deleted between lookup and update, typically by our own previous
            // session's departure; fall through and create a new one.
            Err(err) if err.is_not_found() => {
                warn!(event = "presence_vanished", id = %current.id, login_id = %identity.login_id);
            }
            Err(err) => return Err(failed(err)),
        }
    }

    let record = store
        .create(NewPresence::online(
            identity.display_name.as_str(),
            identity.login_id.as_str(),
            now,
        ))
        .await
        .map_err(failed)?;
    info!(event = "presence_created", id = %record.id, login_id = %identity.login_id);
    Ok(record)
}

fn freshest(records: &[PresenceRecord]) -> Option<&PresenceRecord> {
    records
        .iter()
        .max_by(|a, b| a.last_seen.cmp(&b.last_seen).then_with(|| b.id.cmp(&a.id)))
}
