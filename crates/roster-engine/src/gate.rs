use crate::session::{PresenceService, PresenceSession};
use roster_core::Identity;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Inputs the gate follows: who is signed in, and whether the surface
/// showing the roster is visible.
pub struct GateSignals {
    pub identity: watch::Receiver<Option<Identity>>,
    pub visible: watch::Receiver<bool>,
    pub shutdown: watch::Receiver<bool>,
}

/// Runs at most one session, for whoever the identity channel names.
///
/// With no identity nothing touches the store. An identity change tears the
/// old session down before the new one registers. Returns after `shutdown`
/// flips or the identity channel closes, with any live session departed.
pub async fn run_session_gate(service: PresenceService, mut signals: GateSignals) {
    let initial = signals.identity.borrow_and_update().clone();
    let mut session = switch(&service, None, initial).await;
    let mut visibility_reported = true;
    let visible = *signals.visible.borrow_and_update();
    sync_visibility(session.as_mut(), visible).await;

    loop {
        tokio::select! {
            changed = signals.shutdown.changed() => {
                if changed.is_err() || *signals.shutdown.borrow() {
                    break;
                }
            }
            changed = signals.identity.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = signals.identity.borrow_and_update().clone();
                session = switch(&service, session, next).await;
                let visible = *signals.visible.borrow();
                sync_visibility(session.as_mut(), visible).await;
            }
            changed = signals.visible.changed(), if visibility_reported => {
                if changed.is_err() {
                    // Keep the last reported value.
                    visibility_reported = false;
                    continue;
                }
                let visible = *signals.visible.borrow_and_update();
                sync_visibility(session.as_mut(), visible).await;
            }
        }
    }

    if let Some(active) = session.take() {
        active.session.teardown().await;
    }
    debug!(event = "gate_stopped");
}

pub fn spawn_session_gate(service: PresenceService, signals: GateSignals) -> JoinHandle<()> {
    tokio::spawn(run_session_gate(service, signals))
}

/// A running session plus the visibility last queued to its engine.
///
/// Tracked here rather than read back from the engine's status, which lags
/// behind commands still waiting in its queue.
struct GateSession {
    session: PresenceSession,
    forwarded: bool,
}

async fn switch(
    service: &PresenceService,
    current: Option<GateSession>,
    next: Option<Identity>,
) -> Option<GateSession> {
    if let (Some(active), Some(identity)) = (current.as_ref(), next.as_ref()) {
        if active.session.identity() == identity {
            return current;
        }
    }
    if let Some(active) = current {
        info!(event = "session_switch", from = %active.session.identity().login_id);
        active.session.teardown().await;
    }

    let identity = next?;
    match service.start_session(identity).await {
        // A freshly registered engine starts online.
        Ok(session) => Some(GateSession {
            session,
            forwarded: true,
        }),
        Err(err) => {
            warn!(event = "session_unavailable", error = %err);
            None
        }
    }
}

async fn sync_visibility(session: Option<&mut GateSession>, visible: bool) {
    let Some(active) = session else {
        return;
    };
    if active.forwarded == visible {
        return;
    }
    match active.session.set_visible(visible).await {
        Ok(()) => active.forwarded = visible,
        Err(err) => warn!(event = "visibility_dropped", error = %err),
    }
}
