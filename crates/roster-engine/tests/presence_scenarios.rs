use chrono::{DateTime, TimeZone, Utc};
use roster_core::{
    Clock, Identity, PresenceConfig, PresenceRecord, RecordId, ViewState, INIT_FAILED_MESSAGE,
    SUBSCRIBE_FAILED_MESSAGE,
};
use roster_engine::{
    run_session_gate, spawn_session_gate, DepartOutcome, GateSignals, PresenceObserver,
    PresenceService,
};
use roster_store::{MemoryStore, StoreOp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Wall clock that moves with tokio's paused test time.
struct TestClock {
    base: DateTime<Utc>,
    start: Instant,
}

impl TestClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Utc
                .timestamp_opt(1_760_000_000, 0)
                .single()
                .expect("valid base timestamp"),
            start: Instant::now(),
        })
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).expect("elapsed fits");
        self.base + elapsed
    }
}

fn identity(login: &str) -> Identity {
    Identity::new(login, login.split('@').next().unwrap_or(login)).expect("identity")
}

fn service(store: &Arc<MemoryStore>, clock: &Arc<TestClock>) -> PresenceService {
    PresenceService::new(store.clone(), clock.clone(), PresenceConfig::default())
        .expect("default config is valid")
}

fn other_client(id: &str, clock: &TestClock, age_secs: i64) -> PresenceRecord {
    PresenceRecord {
        id: RecordId::from(id),
        username: id.to_string(),
        email: format!("{id}@example.com"),
        is_online: true,
        last_seen: clock.now() - chrono::Duration::seconds(age_secs),
    }
}

fn logins(observer: &PresenceObserver) -> Vec<String> {
    observer
        .online_users()
        .into_iter()
        .map(|user| user.email)
        .collect()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn restarting_a_session_reuses_the_record() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let ada = identity("ada@example.com");

    let first = service(&store, &clock)
        .start_session(ada.clone())
        .await
        .expect("first session");
    let first_id = first.liveness().record_id.expect("registered");

    let second = service(&store, &clock)
        .start_session(ada)
        .await
        .expect("second session");
    let second_id = second.liveness().record_id.expect("registered");

    assert_eq!(first_id, second_id);
    assert_eq!(store.records().len(), 1);
    assert_eq!(store.attempts(StoreOp::Create), 1);

    second.teardown().await;
    first.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_recovers_after_consecutive_failures() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let session = service(&store, &clock)
        .start_session(identity("ada@example.com"))
        .await
        .expect("session");
    let registered_at = store.records()[0].last_seen;

    store.fail_next(StoreOp::Update, 3);
    tokio::time::sleep(Duration::from_secs(91)).await;

    let status = session.liveness();
    assert_eq!(status.heartbeats_sent, 3);
    assert_eq!(status.heartbeat_failures, 3);
    assert_eq!(store.records()[0].last_seen, registered_at);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let status = session.liveness();
    assert_eq!(status.heartbeats_sent, 4);
    assert_eq!(status.heartbeat_failures, 3);
    assert_eq!(
        store.records()[0].last_seen,
        registered_at + chrono::Duration::seconds(120)
    );

    session.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_client_drops_out_after_threshold() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let service = service(&store, &clock);
    let observer = service.observer();
    store.insert_raw(other_client("stalled", &clock, 0));

    let session = service
        .start_session(identity("ada@example.com"))
        .await
        .expect("session");
    settle().await;
    assert_eq!(
        logins(&observer),
        vec!["ada@example.com", "stalled@example.com"]
    );

    // One last beat at +29s, then the stalled client goes quiet.
    tokio::time::sleep(Duration::from_secs(29)).await;
    store.insert_raw(other_client("stalled", &clock, 0));
    settle().await;
    assert_eq!(logins(&observer).len(), 2);

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(logins(&observer), vec!["ada@example.com"]);
    assert_eq!(
        observer.current().online_users.len(),
        1,
        "sweep prunes the published set too"
    );

    session.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn snapshot_excludes_stale_and_offline_records() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let service = service(&store, &clock);
    let observer = service.observer();
    let session = service
        .start_session(identity("ada@example.com"))
        .await
        .expect("session");

    store.insert_raw(other_client("bob", &clock, 10));
    store.insert_raw(other_client("carol", &clock, 200));
    let mut dave = other_client("dave", &clock, 5);
    dave.is_online = false;
    store.insert_raw(dave);
    settle().await;

    assert_eq!(
        logins(&observer),
        vec!["ada@example.com", "bob@example.com"]
    );
    assert_eq!(observer.current().state(), ViewState::Ready);

    session.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn departure_removes_record_for_everyone() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let watcher = service(&store, &clock);
    let observer = watcher.observer();
    let watching = watcher
        .start_session(identity("bob@example.com"))
        .await
        .expect("watcher session");

    let leaving = service(&store, &clock)
        .start_session(identity("ada@example.com"))
        .await
        .expect("leaving session");
    settle().await;
    assert_eq!(logins(&observer).len(), 2);

    assert_eq!(leaving.teardown().await, DepartOutcome::Deleted);
    settle().await;
    assert_eq!(logins(&observer), vec!["bob@example.com"]);

    watching.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_departure_ages_out_instead() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let watcher = service(&store, &clock);
    let observer = watcher.observer();
    let watching = watcher
        .start_session(identity("bob@example.com"))
        .await
        .expect("watcher session");

    let leaving = service(&store, &clock)
        .start_session(identity("ada@example.com"))
        .await
        .expect("leaving session");
    store.fail_next(StoreOp::Delete, 1);
    assert_eq!(leaving.teardown().await, DepartOutcome::Failed);
    assert_eq!(store.records().len(), 2);
    assert_eq!(store.attempts(StoreOp::Delete), 1);

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(logins(&observer), vec!["bob@example.com"]);
    assert_eq!(store.attempts(StoreOp::Delete), 1, "departure is never retried");

    watching.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_departure_does_not_hold_teardown() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let session = service(&store, &clock)
        .start_session(identity("ada@example.com"))
        .await
        .expect("session");

    store.set_delete_delay(Some(Duration::from_secs(60)));
    let started = Instant::now();
    assert_eq!(session.teardown().await, DepartOutcome::TimedOut);
    assert!(started.elapsed() <= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn teardown_stops_all_store_traffic() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let session = service(&store, &clock)
        .start_session(identity("ada@example.com"))
        .await
        .expect("session");
    settle().await;
    assert_eq!(store.subscriber_count(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(session.teardown().await, DepartOutcome::Deleted);
    let updates = store.attempts(StoreOp::Update);
    assert_eq!(store.subscriber_count(), 0);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(store.attempts(StoreOp::Update), updates);
    assert!(store.records().is_empty(), "no heartbeat resurrects the record");
}

#[tokio::test(start_paused = true)]
async fn registration_failure_starts_nothing() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let service = service(&store, &clock);
    let observer = service.observer();
    store.set_offline(true);

    let err = service
        .start_session(identity("ada@example.com"))
        .await
        .err()
        .expect("registration fails");
    assert_eq!(err.kind(), "registration");

    let view = observer.current();
    assert_eq!(view.error.as_deref(), Some(INIT_FAILED_MESSAGE));
    assert!(!view.is_loading);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(store.attempts(StoreOp::Subscribe), 0);
    assert_eq!(store.attempts(StoreOp::Update), 0);
}

#[tokio::test(start_paused = true)]
async fn subscription_failure_keeps_last_set_and_heartbeat() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let service = service(&store, &clock);
    let observer = service.observer();
    let session = service
        .start_session(identity("ada@example.com"))
        .await
        .expect("session");
    settle().await;

    store.fail_subscriptions("connection reset");
    settle().await;

    let view = observer.current();
    assert_eq!(view.error.as_deref(), Some(SUBSCRIBE_FAILED_MESSAGE));
    assert_eq!(view.online_users.len(), 1);
    assert_eq!(store.subscriber_count(), 0);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(session.liveness().heartbeats_sent, 1);
    assert_eq!(session.liveness().heartbeat_failures, 0);

    session.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn gate_without_identity_never_touches_the_store() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let service = service(&store, &clock);
    let observer = service.observer();

    let (identity_tx, identity_rx) = watch::channel(None);
    let (_visible_tx, visible_rx) = watch::channel(true);
    let (stop_tx, stop_rx) = watch::channel(false);
    let gate = spawn_session_gate(
        service,
        GateSignals {
            identity: identity_rx,
            visible: visible_rx,
            shutdown: stop_rx,
        },
    );

    tokio::time::sleep(Duration::from_secs(300)).await;
    for op in [
        StoreOp::Create,
        StoreOp::Update,
        StoreOp::Delete,
        StoreOp::List,
        StoreOp::Subscribe,
    ] {
        assert_eq!(store.attempts(op), 0, "{} with no identity", op.as_str());
    }
    assert!(!observer.current().is_loading);

    identity_tx
        .send(Some(identity("ada@example.com")))
        .expect("gate listening");
    settle().await;
    assert_eq!(store.records().len(), 1);

    identity_tx.send(None).expect("gate listening");
    settle().await;
    assert!(store.records().is_empty());
    assert_eq!(store.subscriber_count(), 0);

    stop_tx.send(true).expect("gate listening");
    gate.await.expect("gate task");
}

#[tokio::test(start_paused = true)]
async fn gate_switches_identity_and_forwards_visibility() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let service = service(&store, &clock);

    let (identity_tx, identity_rx) = watch::channel(Some(identity("ada@example.com")));
    let (visible_tx, visible_rx) = watch::channel(true);
    let (stop_tx, stop_rx) = watch::channel(false);
    let gate = spawn_session_gate(
        service,
        GateSignals {
            identity: identity_rx,
            visible: visible_rx,
            shutdown: stop_rx,
        },
    );
    settle().await;

    visible_tx.send(false).expect("gate listening");
    settle().await;
    assert!(!store.records()[0].is_online);

    visible_tx.send(true).expect("gate listening");
    settle().await;
    assert!(store.records()[0].is_online);

    identity_tx
        .send(Some(identity("grace@example.com")))
        .expect("gate listening");
    settle().await;
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].email, "grace@example.com");

    stop_tx.send(true).expect("gate listening");
    gate.await.expect("gate task");
    assert!(store.records().is_empty());
}

fn assert_send<T: Send>(_: &T) {}

#[test]
fn gate_future_is_send() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let (_identity_tx, identity_rx) = watch::channel(None);
    let (_visible_tx, visible_rx) = watch::channel(true);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let gate = run_session_gate(
        service(&store, &clock),
        GateSignals {
            identity: identity_rx,
            visible: visible_rx,
            shutdown: stop_rx,
        },
    );
    assert_send(&gate);
}

#[tokio::test(start_paused = true)]
async fn identity_switch_while_hidden_keeps_new_record_hidden() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let (identity_tx, identity_rx) = watch::channel(Some(identity("ada@example.com")));
    let (visible_tx, visible_rx) = watch::channel(true);
    let (stop_tx, stop_rx) = watch::channel(false);
    let gate = spawn_session_gate(
        service(&store, &clock),
        GateSignals {
            identity: identity_rx,
            visible: visible_rx,
            shutdown: stop_rx,
        },
    );
    settle().await;

    visible_tx.send(false).expect("gate listening");
    settle().await;
    identity_tx
        .send(Some(identity("grace@example.com")))
        .expect("gate listening");
    settle().await;

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].email, "grace@example.com");
    assert!(!records[0].is_online, "new session inherits the hidden surface");

    stop_tx.send(true).expect("gate listening");
    gate.await.expect("gate task");
}

#[tokio::test(start_paused = true)]
async fn gate_keeps_latest_visibility_while_engine_busy() {
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::new();
    let (_identity_tx, identity_rx) = watch::channel(Some(identity("ada@example.com")));
    let (visible_tx, visible_rx) = watch::channel(true);
    let (stop_tx, stop_rx) = watch::channel(false);
    let gate = spawn_session_gate(
        service(&store, &clock),
        GateSignals {
            identity: identity_rx,
            visible: visible_rx,
            shutdown: stop_rx,
        },
    );
    settle().await;

    // The 30s beat is still waiting on the store when the surface flickers.
    store.set_update_delay(Some(Duration::from_secs(5)));
    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    visible_tx.send(false).expect("gate listening");
    settle().await;
    visible_tx.send(true).expect("gate listening");
    settle().await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(store.attempts(StoreOp::Update), 3, "beat, hide, then show");
    assert!(store.records()[0].is_online, "last reported visibility wins");

    store.set_update_delay(None);
    stop_tx.send(true).expect("gate listening");
    gate.await.expect("gate task");
}
