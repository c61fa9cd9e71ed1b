use crate::error::{EngineError, PresenceError};
use crate::registration::register_or_resume;
use roster_core::{Clock, Identity, PresenceConfig, PresencePatch, RecordId};
use roster_store::RecordStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Unregistered,
    Online,
    Away,
    Departed,
}

impl LivenessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessState::Unregistered => "unregistered",
            LivenessState::Online => "online",
            LivenessState::Away => "away",
            LivenessState::Departed => "departed",
        }
    }
}

/// How a departure ended. Every variant is final: the record either went
/// away or is left for other observers to age out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartOutcome {
    Deleted,
    AlreadyGone,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessStatus {
    pub state: LivenessState,
    pub record_id: Option<RecordId>,
    pub heartbeats_sent: u64,
    pub heartbeat_failures: u64,
    pub status_updates_sent: u64,
    pub status_update_failures: u64,
    pub last_error: Option<String>,
}

impl Default for LivenessStatus {
    fn default() -> Self {
        Self {
            state: LivenessState::Unregistered,
            record_id: None,
            heartbeats_sent: 0,
            heartbeat_failures: 0,
            status_updates_sent: 0,
            status_update_failures: 0,
            last_error: None,
        }
    }
}

#[derive(Debug)]
pub enum LivenessCommand {
    Heartbeat,
    SetVisible(bool),
    Depart(oneshot::Sender<DepartOutcome>),
}

/// Keeps one identity's record fresh.
///
/// Owns the record id for the whole session. Heartbeats and visibility
/// updates are fire-and-forget: a failed write is logged and counted, and the
/// next tick tries again.
pub struct LivenessEngine {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
    record_id: RecordId,
    status: watch::Sender<LivenessStatus>,
}

impl LivenessEngine {
    /// Registers or resumes the identity's record; the engine starts Online.
    pub async fn register(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
        identity: &Identity,
    ) -> Result<Self, PresenceError> {
        let record = register_or_resume(store.as_ref(), identity, clock.now()).await?;
        let (status, _) = watch::channel(LivenessStatus {
            state: LivenessState::Online,
            record_id: Some(record.id.clone()),
            ..LivenessStatus::default()
        });
        Ok(Self {
            store,
            clock,
            config,
            record_id: record.id,
            status,
        })
    }

    pub fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    pub fn status(&self) -> LivenessStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> LivenessState {
        self.status.borrow().state
    }

    /// Touches `lastSeen` and asserts `isOnline`, even while away.
    pub async fn heartbeat(&mut self) {
        if self.state() == LivenessState::Departed {
            return;
        }
        let patch = PresencePatch::status(true, self.clock.now());
        let result = self.store.update(&self.record_id, patch).await;
        match result {
            Ok(_) => {
                debug!(event = "heartbeat", id = %self.record_id);
                self.status.send_modify(|status| status.heartbeats_sent += 1);
            }
            Err(err) => {
                let err = PresenceError::Heartbeat(err);
                warn!(event = "heartbeat_failed", id = %self.record_id, error = %err);
                self.status.send_modify(|status| {
                    status.heartbeats_sent += 1;
                    status.heartbeat_failures += 1;
                    status.last_error = Some(err.to_string());
                });
            }
        }
    }

    pub async fn set_visible(&mut self, visible: bool) {
        if self.state() == LivenessState::Departed {
            return;
        }
        let next = if visible {
            LivenessState::Online
        } else {
            LivenessState::Away
        };
        self.status.send_modify(|status| status.state = next);

        let patch = PresencePatch::status(visible, self.clock.now());
        match self.store.update(&self.record_id, patch).await {
            Ok(_) => {
                info!(event = "visibility_changed", id = %self.record_id, state = next.as_str());
                self.status.send_modify(|status| status.status_updates_sent += 1);
            }
            Err(err) => {
                let err = PresenceError::StatusUpdate(err);
                warn!(event = "status_update_failed", id = %self.record_id, error = %err);
                self.status.send_modify(|status| {
                    status.status_updates_sent += 1;
                    status.status_update_failures += 1;
                    status.last_error = Some(err.to_string());
                });
            }
        }
    }

    /// Deletes the record, bounded by the departure timeout. Never retried.
    pub async fn depart(&mut self) -> DepartOutcome {
        if self.state() == LivenessState::Departed {
            return DepartOutcome::AlreadyGone;
        }
        self.status.send_modify(|status| status.state = LivenessState::Departed);

        let timeout = self.config.departure_timeout;
        let outcome = match tokio::time::timeout(timeout, self.store.delete(&self.record_id)).await
        {
            Ok(Ok(())) => DepartOutcome::Deleted,
            Ok(Err(err)) if err.is_not_found() => DepartOutcome::AlreadyGone,
            Ok(Err(err)) => {
                let err = PresenceError::Departure(err);
                warn!(event = "departure_failed", id = %self.record_id, error = %err);
                self.record_error(&err);
                DepartOutcome::Failed
            }
            Err(_) => {
                let err = PresenceError::DepartureTimeout(timeout);
                warn!(event = "departure_failed", id = %self.record_id, error = %err);
                self.record_error(&err);
                DepartOutcome::TimedOut
            }
        };
        info!(event = "departed", id = %self.record_id, outcome = ?outcome);
        outcome
    }

    fn record_error(&self, err: &PresenceError) {
        let message = err.to_string();
        self.status
            .send_modify(|status| status.last_error = Some(message));
    }

    /// Moves the engine onto its own task. All writes for the record are
    /// serialized through the returned handle.
    pub fn spawn(self) -> (LivenessHandle, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let handle = LivenessHandle {
            commands,
            status: self.status.subscribe(),
        };
        let task = tokio::spawn(self.run(receiver));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<LivenessCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                LivenessCommand::Heartbeat => self.heartbeat().await,
                LivenessCommand::SetVisible(visible) => self.set_visible(visible).await,
                LivenessCommand::Depart(reply) => {
                    let outcome = self.depart().await;
                    let _ = reply.send(outcome);
                    return;
                }
            }
        }
        // Every handle dropped without departing.
        self.depart().await;
    }
}

#[derive(Debug, Clone)]
pub struct LivenessHandle {
    commands: mpsc::Sender<LivenessCommand>,
    status: watch::Receiver<LivenessStatus>,
}

impl LivenessHandle {
    pub async fn heartbeat(&self) -> Result<(), EngineError> {
        self.send(LivenessCommand::Heartbeat).await
    }

    pub async fn set_visible(&self, visible: bool) -> Result<(), EngineError> {
        self.send(LivenessCommand::SetVisible(visible)).await
    }

    /// Waits for the engine to finish its departure; the engine stops after.
    pub async fn depart(&self) -> Result<DepartOutcome, EngineError> {
        let (reply, outcome) = oneshot::channel();
        self.send(LivenessCommand::Depart(reply)).await?;
        outcome.await.map_err(|_| EngineError::Stopped)
    }

    pub fn status(&self) -> LivenessStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<LivenessStatus> {
        self.status.clone()
    }

    async fn send(&self, command: LivenessCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Stopped)
    }
}

/// Emits one heartbeat per interval until `shutdown` flips or the engine
/// stops. The first beat lands one interval after start; registration
/// already wrote a fresh `lastSeen`.
pub fn spawn_heartbeat(
    handle: LivenessHandle,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if handle.heartbeat().await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(event = "heartbeat_stopped");
    })
}
