//! Shared presence contracts: the record model, the staleness predicate,
//! identity, configuration and the view published to renderers.

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod presence;
pub mod view;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PresenceConfig, DEFAULT_DEPARTURE_TIMEOUT};
pub use error::{ConfigError, IdentityError};
pub use identity::Identity;
pub use presence::{
    filter_active, sort_roster, NewPresence, PresencePatch, PresenceRecord, RecordFilter,
    RecordId, HEARTBEAT_INTERVAL, INACTIVE_THRESHOLD,
};
pub use view::{
    PresenceView, ViewState, INIT_FAILED_MESSAGE, LOAD_FAILED_MESSAGE, SUBSCRIBE_FAILED_MESSAGE,
};
