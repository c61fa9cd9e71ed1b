use crate::error::StoreError;
use crate::feed::{ChangeFeed, Subscription};
use crate::RecordStore;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use roster_core::{NewPresence, PresencePatch, PresenceRecord, RecordFilter, RecordId};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub const PRESENCE_SCHEMA_VERSION: i64 = 1;

const SELECT_COLUMNS: &str = "SELECT id, username, email, is_online, last_seen FROM user_presence";

struct SqliteInner {
    conn: Connection,
    data_version: i64,
}

struct Shared {
    inner: Mutex<SqliteInner>,
    feed: ChangeFeed,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_locked(&self, conn: &Connection) {
        match select_records(conn, &RecordFilter::all()) {
            Ok(snapshot) => self.feed.publish(snapshot),
            Err(err) => {
                warn!(event = "snapshot_failed", error = %err);
                self.feed.fail(err.to_string());
            }
        }
    }
}

/// Presence collection in a SQLite file.
///
/// Writes made through this handle are pushed to its subscribers directly.
/// Writes from other processes sharing the file are picked up by
/// [`SqliteStore::poll_changes`], which compares `PRAGMA data_version`.
///
/// Every trait call runs on the blocking pool. A write waiting out another
/// process's lock occupies a blocking thread, not a runtime worker.
pub struct SqliteStore {
    shared: Arc<Shared>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(2))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        migrate(&conn)?;
        let data_version = data_version(&conn)?;
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(SqliteInner { conn, data_version }),
                feed: ChangeFeed::default(),
            }),
        })
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        schema_version(&self.shared.lock().conn)
    }

    /// Publishes a fresh snapshot if another connection committed since the
    /// last check. Returns whether anything was published. Blocks.
    pub fn poll_changes(&self) -> Result<bool, StoreError> {
        let mut inner = self.shared.lock();
        let current = data_version(&inner.conn)?;
        if current == inner.data_version {
            return Ok(false);
        }
        inner.data_version = current;
        let snapshot = select_records(&inner.conn, &RecordFilter::all())?;
        self.shared.feed.publish(snapshot);
        debug!(event = "external_change", data_version = current);
        Ok(true)
    }

    pub fn spawn_change_poller(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let store = self.clone();
                        match tokio::task::spawn_blocking(move || store.poll_changes()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(err)) => warn!(event = "change_poll_failed", error = %err),
                            Err(err) => warn!(event = "change_poll_failed", error = %err),
                        }
                    }
                }
            }
        })
    }

    /// Runs `work` under the connection lock on the blocking pool.
    async fn run_blocking<T, F>(&self, op: &'static str, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Shared, &mut SqliteInner) -> Result<T, StoreError> + Send + 'static,
    {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let mut inner = shared.lock();
            work(&shared, &mut inner)
        })
        .await
        .map_err(|err| StoreError::unavailable(format!("sqlite {op} task failed: {err}")))?
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn create(&self, fields: NewPresence) -> Result<PresenceRecord, StoreError> {
        self.run_blocking("create", move |shared, inner| {
            let id = RecordId::new(Uuid::new_v4().to_string());
            inner.conn.execute(
                "
                INSERT INTO user_presence (id, username, email, is_online, last_seen)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![
                    id.as_str(),
                    fields.username,
                    fields.email,
                    fields.is_online,
                    encode_ts(fields.last_seen),
                ],
            )?;
            let record =
                select_one(&inner.conn, &id)?.ok_or_else(|| StoreError::NotFound(id))?;
            shared.publish_locked(&inner.conn);
            Ok(record)
        })
        .await
    }

    async fn update(
        &self,
        id: &RecordId,
        patch: PresencePatch,
    ) -> Result<PresenceRecord, StoreError> {
        let id = id.clone();
        self.run_blocking("update", move |shared, inner| {
            let changes = inner.conn.execute(
                "
                UPDATE user_presence
                SET is_online = COALESCE(?2, is_online),
                    last_seen = COALESCE(?3, last_seen)
                WHERE id = ?1
                ",
                params![id.as_str(), patch.is_online, patch.last_seen.map(encode_ts)],
            )?;
            if changes == 0 {
                return Err(StoreError::NotFound(id));
            }
            let record =
                select_one(&inner.conn, &id)?.ok_or_else(|| StoreError::NotFound(id.clone()))?;
            shared.publish_locked(&inner.conn);
            Ok(record)
        })
        .await
    }

    async fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        let id = id.clone();
        self.run_blocking("delete", move |shared, inner| {
            let changes = inner
                .conn
                .execute("DELETE FROM user_presence WHERE id = ?1", params![id.as_str()])?;
            if changes == 0 {
                return Err(StoreError::NotFound(id));
            }
            shared.publish_locked(&inner.conn);
            Ok(())
        })
        .await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<PresenceRecord>, StoreError> {
        let filter = filter.clone();
        self.run_blocking("list", move |_, inner| select_records(&inner.conn, &filter))
            .await
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        self.run_blocking("subscribe", |shared, inner| {
            let current = select_records(&inner.conn, &RecordFilter::all())?;
            Ok(shared.feed.subscribe(current))
        })
        .await
    }
}


fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn data_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA data_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current = schema_version(conn)?;
    if current > PRESENCE_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current,
            supported: PRESENCE_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        let sql = include_str!("../migrations/0001_presence_schema.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
    }

    Ok(())
}

fn select_one(conn: &Connection, id: &RecordId) -> Result<Option<PresenceRecord>, StoreError> {
    let row = conn
        .query_row(
            &format!("{SELECT_COLUMNS} WHERE id = ?1"),
            params![id.as_str()],
            read_row,
        )
        .optional()?;
    row.map(decode_row).transpose()
}

fn select_records(
    conn: &Connection,
    filter: &RecordFilter,
) -> Result<Vec<PresenceRecord>, StoreError> {
    let mut clauses = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if let Some(email) = &filter.email {
        values.push(Value::Text(email.clone()));
        clauses.push(format!("email = ?{}", values.len()));
    }
    if let Some(username) = &filter.username {
        values.push(Value::Text(username.clone()));
        clauses.push(format!("username = ?{}", values.len()));
    }
    if let Some(is_online) = filter.is_online {
        values.push(Value::Integer(i64::from(is_online)));
        clauses.push(format!("is_online = ?{}", values.len()));
    }

    let mut sql = SELECT_COLUMNS.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY rowid");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), read_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(decode_row(row?)?);
    }
    Ok(records)
}

type RawRow = (String, String, String, bool, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_row(
    (id, username, email, is_online, last_seen): RawRow,
) -> Result<PresenceRecord, StoreError> {
    Ok(PresenceRecord {
        id: RecordId::new(id),
        username,
        email,
        is_online,
        last_seen: decode_ts(&last_seen)?,
    })
}

fn encode_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Timestamp(format!("{value}: {err}")))
}
