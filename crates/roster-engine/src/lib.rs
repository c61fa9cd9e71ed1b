//! Heartbeat/timeout presence over a [`RecordStore`](roster_store::RecordStore).
//!
//! A [`PresenceService`] starts one [`PresenceSession`] per signed-in
//! identity. The session keeps that identity's record fresh through a
//! [`LivenessEngine`] and publishes everyone else's through an
//! [`ActiveSetReconciler`]. [`run_session_gate`] drives sessions from an
//! identity channel.

mod error;
mod gate;
mod liveness;
mod reconciler;
mod registration;
mod session;

pub use error::{EngineError, PresenceError};
pub use gate::{run_session_gate, spawn_session_gate, GateSignals};
pub use liveness::{
    spawn_heartbeat, DepartOutcome, LivenessCommand, LivenessEngine, LivenessHandle,
    LivenessState, LivenessStatus,
};
pub use reconciler::{ActiveSetReconciler, PresenceObserver, ReconcilerExit};
pub use registration::register_or_resume;
pub use session::{PresenceService, PresenceSession};
