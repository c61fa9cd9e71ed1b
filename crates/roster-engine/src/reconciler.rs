use crate::error::{EngineError, PresenceError};
use chrono::{DateTime, Utc};
use roster_core::{
    filter_active, Clock, PresenceConfig, PresenceRecord, PresenceView, RecordFilter,
    LOAD_FAILED_MESSAGE, SUBSCRIBE_FAILED_MESSAGE,
};
use roster_store::{RecordStore, Subscription};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Why a reconciler loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerExit {
    Shutdown,
    SubscriptionFailed(String),
}

/// Maintains the active set from full snapshots.
///
/// Every snapshot replaces the set outright; nothing is merged. The last raw
/// snapshot is retained so a sweep can drop records that aged out while the
/// feed was quiet.
pub struct ActiveSetReconciler {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
    view: Arc<watch::Sender<PresenceView>>,
    snapshot: Option<Vec<PresenceRecord>>,
}

impl ActiveSetReconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
        view: Arc<watch::Sender<PresenceView>>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            view,
            snapshot: None,
        }
    }

    /// One-shot list of online records. A failure sets the load error and
    /// leaves the set empty; the subscription may still recover it.
    pub async fn initial_load(&mut self) -> Result<(), PresenceError> {
        match self.store.list(&RecordFilter::online()).await {
            Ok(records) => {
                self.apply_snapshot(records);
                Ok(())
            }
            Err(err) => {
                let err = PresenceError::List(err);
                warn!(event = "initial_load_failed", error = %err);
                self.publish(PresenceView::failed(LOAD_FAILED_MESSAGE));
                Err(err)
            }
        }
    }

    /// Replaces the active set with the filtered snapshot. A load error
    /// already on the view stays there.
    pub fn apply_snapshot(&mut self, records: Vec<PresenceRecord>) {
        let active = self.filter(&records);
        debug!(event = "snapshot_applied", total = records.len(), active = active.len());
        self.snapshot = Some(records);
        let error = self.view.borrow().error.clone();
        self.publish(PresenceView {
            error,
            ..PresenceView::ready(active)
        });
    }

    /// Re-filters the retained snapshot against the current time.
    pub fn sweep(&mut self) {
        let Some(records) = self.snapshot.as_ref() else {
            return;
        };
        let active = self.filter(records);
        self.view.send_if_modified(|view| {
            if view.online_users == active {
                return false;
            }
            debug!(event = "sweep_pruned", before = view.online_users.len(), after = active.len());
            view.online_users = active;
            true
        });
    }

    /// Keeps the last active set and marks the feed as lost.
    pub fn fail_subscription(&self, err: &PresenceError) {
        warn!(event = "subscription_failed", error = %err);
        self.view.send_modify(|view| {
            view.is_loading = false;
            view.error = Some(SUBSCRIBE_FAILED_MESSAGE.to_string());
        });
    }

    /// Subscribes and applies snapshots until `shutdown` flips or the feed
    /// fails. The subscription is released when this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ReconcilerExit {
        let mut subscription = match self.store.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                let err = PresenceError::Subscription(err);
                self.fail_subscription(&err);
                return ReconcilerExit::SubscriptionFailed(err.to_string());
            }
        };
        info!(event = "subscribed");

        let every = self.config.sweep_interval;
        let mut sweeper = tokio::time::interval_at(Instant::now() + every, every);
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let exit = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break ReconcilerExit::Shutdown;
                    }
                }
                event = subscription.next() => match event {
                    Some(Ok(records)) => self.apply_snapshot(records),
                    Some(Err(err)) => {
                        let err = PresenceError::Subscription(err);
                        self.fail_subscription(&err);
                        break ReconcilerExit::SubscriptionFailed(err.to_string());
                    }
                    None => {
                        let err = PresenceError::Subscription(
                            roster_store::StoreError::Subscription("feed closed".to_string()),
                        );
                        self.fail_subscription(&err);
                        break ReconcilerExit::SubscriptionFailed(err.to_string());
                    }
                },
                _ = sweeper.tick() => self.sweep(),
            }
        };
        release(subscription);
        exit
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<ReconcilerExit> {
        tokio::spawn(self.run(shutdown))
    }

    fn filter(&self, records: &[PresenceRecord]) -> Vec<PresenceRecord> {
        filter_active(records, self.clock.now(), self.config.inactive_threshold)
    }

    fn publish(&self, next: PresenceView) {
        self.view.send_if_modified(|view| {
            if *view == next {
                return false;
            }
            *view = next;
            true
        });
    }
}

fn release(subscription: Subscription) {
    subscription.unsubscribe();
    debug!(event = "unsubscribed");
}

/// Read side of the published view.
#[derive(Clone)]
pub struct PresenceObserver {
    view: watch::Receiver<PresenceView>,
    clock: Arc<dyn Clock>,
    threshold: std::time::Duration,
}

impl PresenceObserver {
    pub fn new(
        view: watch::Receiver<PresenceView>,
        clock: Arc<dyn Clock>,
        threshold: std::time::Duration,
    ) -> Self {
        Self {
            view,
            clock,
            threshold,
        }
    }

    pub fn current(&self) -> PresenceView {
        self.view.borrow().clone()
    }

    /// The published set with staleness re-applied at `now`, so a stalled
    /// reconciler cannot show a record past the threshold.
    pub fn online_users_at(&self, now: DateTime<Utc>) -> Vec<PresenceRecord> {
        self.view.borrow().online_users_at(now, self.threshold)
    }

    pub fn online_users(&self) -> Vec<PresenceRecord> {
        self.online_users_at(self.clock.now())
    }

    pub async fn changed(&mut self) -> Result<PresenceView, EngineError> {
        self.view.changed().await.map_err(|_| EngineError::Stopped)?;
        Ok(self.view.borrow_and_update().clone())
    }
}
