use crate::error::StoreError;
use roster_core::PresenceRecord;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

pub const DEFAULT_FEED_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
enum FeedEvent {
    Snapshot(Arc<Vec<PresenceRecord>>),
    Failed(String),
}

/// Fan-out of full-collection snapshots.
///
/// Stores call `publish` after every mutation while still holding their own
/// lock, and `subscribe` under the same lock, so a subscriber never misses a
/// change between its initial snapshot and its first event.
#[derive(Debug)]
pub struct ChangeFeed {
    sender: broadcast::Sender<FeedEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, snapshot: Vec<PresenceRecord>) {
        let _ = self.sender.send(FeedEvent::Snapshot(Arc::new(snapshot)));
    }

    /// Ends every open subscription with an error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.sender.send(FeedEvent::Failed(reason.into()));
    }

    pub fn subscribe(&self, current: Vec<PresenceRecord>) -> Subscription {
        Subscription {
            initial: Some(current),
            receiver: self.sender.subscribe(),
            pending_failure: None,
            finished: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Standing view of a collection: the current snapshot first, then one
/// snapshot per change. Backlogged snapshots are coalesced into the newest.
#[derive(Debug)]
pub struct Subscription {
    initial: Option<Vec<PresenceRecord>>,
    receiver: broadcast::Receiver<FeedEvent>,
    pending_failure: Option<String>,
    finished: bool,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<Result<Vec<PresenceRecord>, StoreError>> {
        if self.finished {
            return None;
        }
        if let Some(reason) = self.pending_failure.take() {
            self.finished = true;
            return Some(Err(StoreError::Subscription(reason)));
        }
        if let Some(snapshot) = self.initial.take() {
            return Some(Ok(self.coalesce(snapshot)));
        }

        loop {
            match self.receiver.recv().await {
                Ok(FeedEvent::Snapshot(snapshot)) => {
                    let snapshot = snapshot.as_ref().clone();
                    return Some(Ok(self.coalesce(snapshot)));
                }
                Ok(FeedEvent::Failed(reason)) => {
                    self.finished = true;
                    return Some(Err(StoreError::Subscription(reason)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(event = "feed_lagged", skipped = skipped);
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    pub fn unsubscribe(self) {}

    fn coalesce(&mut self, mut latest: Vec<PresenceRecord>) -> Vec<PresenceRecord> {
        loop {
            match self.receiver.try_recv() {
                Ok(FeedEvent::Snapshot(snapshot)) => latest = snapshot.as_ref().clone(),
                Ok(FeedEvent::Failed(reason)) => {
                    self.pending_failure = Some(reason);
                    return latest;
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return latest,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use roster_core::RecordId;

    fn record(id: &str) -> PresenceRecord {
        PresenceRecord {
            id: RecordId::from(id),
            username: id.to_string(),
            email: format!("{id}@example.com"),
            is_online: true,
            last_seen: Utc.timestamp_opt(1_760_000_000, 0).single().expect("ts"),
        }
    }

    #[tokio::test]
    async fn initial_snapshot_coalesces_with_backlog() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe(vec![record("a")]);
        feed.publish(vec![record("a"), record("b")]);

        let first = sub.next().await.expect("event").expect("snapshot");
        assert_eq!(first.len(), 2, "backlog coalesces into the newest snapshot");
    }

    #[tokio::test]
    async fn backlog_collapses_to_newest() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe(Vec::new());
        assert!(sub.next().await.expect("event").expect("snapshot").is_empty());

        feed.publish(vec![record("a")]);
        feed.publish(vec![record("a"), record("b")]);
        feed.publish(vec![record("b")]);

        let latest = sub.next().await.expect("event").expect("snapshot");
        assert_eq!(latest, vec![record("b")]);
    }

    #[tokio::test]
    async fn failure_is_delivered_once_then_ends() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe(Vec::new());
        let _ = sub.next().await;

        feed.fail("socket closed");
        let err = sub.next().await.expect("event").expect_err("failure");
        assert!(matches!(err, StoreError::Subscription(reason) if reason == "socket closed"));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn failure_after_snapshot_in_backlog_is_not_lost() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe(Vec::new());
        let _ = sub.next().await;

        feed.publish(vec![record("a")]);
        feed.fail("gone");

        let snapshot = sub.next().await.expect("event").expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert!(sub.next().await.expect("event").is_err());
    }

    #[tokio::test]
    async fn lagging_subscriber_recovers() {
        let feed = ChangeFeed::new(2);
        let mut sub = feed.subscribe(Vec::new());
        let _ = sub.next().await;

        for idx in 0..10 {
            feed.publish(vec![record(&format!("r{idx}"))]);
        }

        let latest = sub.next().await.expect("event").expect("snapshot");
        assert_eq!(latest, vec![record("r9")]);
    }

    #[test]
    fn dropping_subscription_releases_receiver() {
        let feed = ChangeFeed::default();
        let sub = feed.subscribe(Vec::new());
        assert_eq!(feed.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(feed.subscriber_count(), 0);
    }
}
