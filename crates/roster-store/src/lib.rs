//! Presence record stores.
//!
//! [`RecordStore`] is the whole contract the presence engine relies on:
//! create, update, delete, filtered list and a subscription that replays the
//! complete collection after every change. Nothing here is transactional
//! across calls; callers reconcile on their own.

mod error;
mod feed;
mod memory;
mod sqlite;

use async_trait::async_trait;
use roster_core::{NewPresence, PresencePatch, PresenceRecord, RecordFilter, RecordId};

pub use error::StoreError;
pub use feed::{ChangeFeed, Subscription, DEFAULT_FEED_CAPACITY};
pub use memory::{MemoryStore, StoreOp};
pub use sqlite::{SqliteStore, PRESENCE_SCHEMA_VERSION};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, fields: NewPresence) -> Result<PresenceRecord, StoreError>;

    async fn update(
        &self,
        id: &RecordId,
        patch: PresencePatch,
    ) -> Result<PresenceRecord, StoreError>;

    async fn delete(&self, id: &RecordId) -> Result<(), StoreError>;

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<PresenceRecord>, StoreError>;

    /// Opens a standing subscription; the first item is the current snapshot.
    async fn subscribe(&self) -> Result<Subscription, StoreError>;
}
