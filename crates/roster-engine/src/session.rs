use crate::error::{EngineError, PresenceError};
use crate::liveness::{
    spawn_heartbeat, DepartOutcome, LivenessEngine, LivenessHandle, LivenessStatus,
};
use crate::reconciler::{ActiveSetReconciler, PresenceObserver, ReconcilerExit};
use roster_core::{Clock, Identity, PresenceConfig, PresenceView, INIT_FAILED_MESSAGE};
use roster_store::RecordStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything a presence session needs, built once per process.
#[derive(Clone)]
pub struct PresenceService {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
    view: Arc<watch::Sender<PresenceView>>,
}

impl PresenceService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let (view, _) = watch::channel(PresenceView::idle());
        Ok(Self {
            store,
            clock,
            config,
            view: Arc::new(view),
        })
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn observer(&self) -> PresenceObserver {
        PresenceObserver::new(
            self.view.subscribe(),
            self.clock.clone(),
            self.config.inactive_threshold,
        )
    }

    /// Registers, loads, subscribes, then starts the heartbeat, in that order.
    ///
    /// A registration failure is the only error returned: nothing else is
    /// started and the view carries the init error.
    pub async fn start_session(
        &self,
        identity: Identity,
    ) -> Result<PresenceSession, PresenceError> {
        self.view.send_replace(PresenceView::loading());

        let engine = match LivenessEngine::register(
            self.store.clone(),
            self.clock.clone(),
            self.config,
            &identity,
        )
        .await
        {
            Ok(engine) => engine,
            Err(err) => {
                warn!(event = "session_init_failed", login_id = %identity.login_id, error = %err);
                self.view.send_replace(PresenceView::failed(INIT_FAILED_MESSAGE));
                return Err(err);
            }
        };
        let record_id = engine.record_id().clone();

        let mut reconciler = ActiveSetReconciler::new(
            self.store.clone(),
            self.clock.clone(),
            self.config,
            self.view.clone(),
        );
        // Surfaced through the view; the subscription may still recover.
        let _ = reconciler.initial_load().await;
        let (reconciler_stop, reconciler_shutdown) = watch::channel(false);
        let reconciler_task = reconciler.spawn(reconciler_shutdown);

        let (liveness, engine_task) = engine.spawn();
        let (heartbeat_stop, heartbeat_shutdown) = watch::channel(false);
        let heartbeat_task = spawn_heartbeat(
            liveness.clone(),
            self.config.heartbeat_interval,
            heartbeat_shutdown,
        );

        self.view.send_modify(|view| view.is_loading = false);
        info!(event = "session_started", login_id = %identity.login_id, id = %record_id);

        Ok(PresenceSession {
            identity,
            liveness,
            engine_task,
            heartbeat_stop,
            heartbeat_task,
            reconciler_stop,
            reconciler_task,
            view: self.view.clone(),
        })
    }
}

/// One signed-in identity's presence, from registration to departure.
pub struct PresenceSession {
    identity: Identity,
    liveness: LivenessHandle,
    engine_task: JoinHandle<()>,
    heartbeat_stop: watch::Sender<bool>,
    heartbeat_task: JoinHandle<()>,
    reconciler_stop: watch::Sender<bool>,
    reconciler_task: JoinHandle<ReconcilerExit>,
    view: Arc<watch::Sender<PresenceView>>,
}

impl PresenceSession {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn liveness(&self) -> LivenessStatus {
        self.liveness.status()
    }

    pub fn liveness_handle(&self) -> &LivenessHandle {
        &self.liveness
    }

    pub async fn set_visible(&self, visible: bool) -> Result<(), EngineError> {
        self.liveness.set_visible(visible).await
    }

    /// Stops the heartbeat, drops the subscription, then departs.
    ///
    /// The heartbeat is joined before the delete is queued, so no beat can
    /// land after it and resurrect the record.
    pub async fn teardown(self) -> DepartOutcome {
        let _ = self.heartbeat_stop.send(true);
        if let Err(err) = self.heartbeat_task.await {
            warn!(event = "heartbeat_join_failed", error = %err);
        }

        let _ = self.reconciler_stop.send(true);
        match self.reconciler_task.await {
            Ok(exit) => info!(event = "reconciler_stopped", exit = ?exit),
            Err(err) => warn!(event = "reconciler_join_failed", error = %err),
        }

        let outcome = match self.liveness.depart().await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(event = "departure_skipped", error = %err);
                DepartOutcome::Failed
            }
        };
        if let Err(err) = self.engine_task.await {
            warn!(event = "engine_join_failed", error = %err);
        }

        self.view.send_replace(PresenceView::idle());
        info!(event = "session_ended", login_id = %self.identity.login_id, outcome = ?outcome);
        outcome
    }
}
