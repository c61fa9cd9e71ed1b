use crate::error::StoreError;
use crate::feed::{ChangeFeed, Subscription};
use crate::RecordStore;
use async_trait::async_trait;
use roster_core::{NewPresence, PresencePatch, PresenceRecord, RecordFilter, RecordId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Update,
    Delete,
    List,
    Subscribe,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Create => "create",
            StoreOp::Update => "update",
            StoreOp::Delete => "delete",
            StoreOp::List => "list",
            StoreOp::Subscribe => "subscribe",
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<RecordId, PresenceRecord>,
    next_id: u64,
    offline: bool,
    fail_next: HashMap<StoreOp, u32>,
    attempts: HashMap<StoreOp, u64>,
    delete_delay: Option<Duration>,
    update_delay: Option<Duration>,
}

impl MemoryState {
    fn begin(&mut self, op: StoreOp) -> Result<(), StoreError> {
        *self.attempts.entry(op).or_default() += 1;
        if self.offline {
            return Err(StoreError::unavailable("store offline"));
        }
        if let Some(remaining) = self.fail_next.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::unavailable(format!(
                    "injected {} failure",
                    op.as_str()
                )));
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<PresenceRecord> {
        self.records.values().cloned().collect()
    }
}

/// Process-local record collection with fault injection.
///
/// Stands in for the remote store in tests and demos: every failure mode the
/// engine has to survive (store unreachable, a flaky single operation, a
/// dropped change feed, a slow update or delete) can be switched on here.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    feed: ChangeFeed,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Makes the next `times` calls of `op` fail with `Unavailable`.
    pub fn fail_next(&self, op: StoreOp, times: u32) {
        self.lock().fail_next.insert(op, times);
    }

    /// Terminates every open subscription with an error.
    pub fn fail_subscriptions(&self, reason: impl Into<String>) {
        let _state = self.lock();
        self.feed.fail(reason);
    }

    pub fn set_delete_delay(&self, delay: Option<Duration>) {
        self.lock().delete_delay = delay;
    }

    /// Holds each update for `delay` before it is applied.
    pub fn set_update_delay(&self, delay: Option<Duration>) {
        self.lock().update_delay = delay;
    }

    /// Calls made for `op`, including failed ones.
    pub fn attempts(&self, op: StoreOp) -> u64 {
        self.lock().attempts.get(&op).copied().unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    /// Current contents, bypassing fault injection and counters.
    pub fn records(&self) -> Vec<PresenceRecord> {
        self.lock().snapshot()
    }

    /// Seeds a record as another client would have left it.
    pub fn insert_raw(&self, record: PresenceRecord) {
        let mut state = self.lock();
        state.records.insert(record.id.clone(), record);
        let snapshot = state.snapshot();
        self.feed.publish(snapshot);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create(&self, fields: NewPresence) -> Result<PresenceRecord, StoreError> {
        let mut state = self.lock();
        state.begin(StoreOp::Create)?;
        state.next_id += 1;
        let id = RecordId::new(format!("presence-{}", state.next_id));
        let record = fields.into_record(id.clone());
        state.records.insert(id, record.clone());
        let snapshot = state.snapshot();
        self.feed.publish(snapshot);
        debug!(event = "record_created", id = %record.id, email = %record.email);
        Ok(record)
    }

    async fn update(
        &self,
        id: &RecordId,
        patch: PresencePatch,
    ) -> Result<PresenceRecord, StoreError> {
        let delay = {
            let mut state = self.lock();
            state.begin(StoreOp::Update)?;
            state.update_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        record.apply(&patch);
        let updated = record.clone();
        let snapshot = state.snapshot();
        self.feed.publish(snapshot);
        Ok(updated)
    }

    async fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        let delay = {
            let mut state = self.lock();
            state.begin(StoreOp::Delete)?;
            state.delete_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.records.remove(id).is_none() {
            return Err(StoreError::NotFound(id.clone()));
        }
        let snapshot = state.snapshot();
        self.feed.publish(snapshot);
        debug!(event = "record_deleted", id = %id);
        Ok(())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<PresenceRecord>, StoreError> {
        let mut state = self.lock();
        state.begin(StoreOp::List)?;
        Ok(state
            .records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let mut state = self.lock();
        state.begin(StoreOp::Subscribe)?;
        Ok(self.feed.subscribe(state.snapshot()))
    }
}
