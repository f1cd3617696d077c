//! `SQLite`-backed session store.
//!
//! Uses an `r2d2` pool over `r2d2_sqlite`; every query runs on the blocking
//! thread pool. Timestamps are stored as RFC 3339 UTC strings with
//! millisecond precision so they compare lexicographically.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parley_core::SessionCode;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use super::{SessionRecord, SessionStore, StoreError, cutoff};

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    code                      TEXT PRIMARY KEY,
    presenter_key             TEXT,
    source_language           TEXT NOT NULL,
    settings                  TEXT NOT NULL,
    listener_count            INTEGER NOT NULL DEFAULT 0,
    created_at                TEXT NOT NULL,
    presenter_disconnected_at TEXT,
    updated_at                TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_presenter_key ON sessions(presenter_key);
";

/// Runs on each new pooled connection.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
    }
}

/// Session records in a `SQLite` database.
#[derive(Clone, Debug)]
pub struct SqliteSessionStore {
    pool: ConnectionPool,
}

impl SqliteSessionStore {
    /// Open (creating if needed) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = build_pool(manager, 4)?;
        let store = Self::from_pool(pool)?;
        info!(path = %path.as_ref().display(), "session store opened");
        Ok(store)
    }

    /// Private in-memory database (single pooled connection).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let pool = build_pool(SqliteConnectionManager::memory(), 1)?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: ConnectionPool) -> Result<Self, StoreError> {
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn build_pool(manager: SqliteConnectionManager, size: u32) -> Result<ConnectionPool, StoreError> {
    Ok(Pool::builder()
        .max_size(size)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(PragmaCustomizer {
            busy_timeout_ms: 5_000,
        }))
        .build(manager)?)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

struct RawRow {
    code: String,
    presenter_key: Option<String>,
    source_language: String,
    settings: String,
    listener_count: i64,
    created_at: String,
    presenter_disconnected_at: Option<String>,
    updated_at: String,
}

impl RawRow {
    fn into_record(self) -> Result<SessionRecord, StoreError> {
        let code = SessionCode::parse(&self.code)
            .ok_or_else(|| StoreError::Corrupt(format!("bad session code {:?}", self.code)))?;
        Ok(SessionRecord {
            code,
            presenter_key: self.presenter_key,
            source_language: self.source_language,
            settings: serde_json::from_str(&self.settings)?,
            listener_count: usize::try_from(self.listener_count).unwrap_or(0),
            created_at: parse_ts(&self.created_at)?,
            presenter_disconnected_at: self
                .presenter_disconnected_at
                .as_deref()
                .map(parse_ts)
                .transpose()?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let settings = serde_json::to_string(&record.settings)?;
        let record = record.clone();
        self.with_conn(move |conn| {
            let _ = conn.execute(
                "INSERT INTO sessions (code, presenter_key, source_language, settings,
                     listener_count, created_at, presenter_disconnected_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(code) DO UPDATE SET
                     presenter_key = excluded.presenter_key,
                     source_language = excluded.source_language,
                     settings = excluded.settings,
                     listener_count = excluded.listener_count,
                     presenter_disconnected_at = excluded.presenter_disconnected_at,
                     updated_at = excluded.updated_at
                 WHERE excluded.updated_at >= sessions.updated_at",
                params![
                    record.code.as_str(),
                    record.presenter_key,
                    record.source_language,
                    settings,
                    i64::try_from(record.listener_count).unwrap_or(i64::MAX),
                    format_ts(record.created_at),
                    record.presenter_disconnected_at.map(format_ts),
                    format_ts(record.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_by_code(&self, code: &SessionCode) -> Result<Option<SessionRecord>, StoreError> {
        let code = code.as_str().to_owned();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT code, presenter_key, source_language, settings, listener_count,
                            created_at, presenter_disconnected_at, updated_at
                     FROM sessions WHERE code = ?1",
                    params![code],
                    |row| {
                        Ok(RawRow {
                            code: row.get(0)?,
                            presenter_key: row.get(1)?,
                            source_language: row.get(2)?,
                            settings: row.get(3)?,
                            listener_count: row.get(4)?,
                            created_at: row.get(5)?,
                            presenter_disconnected_at: row.get(6)?,
                            updated_at: row.get(7)?,
                        })
                    },
                )
                .optional()?;
            raw.map(RawRow::into_record).transpose()
        })
        .await
    }

    async fn delete_expired(&self, grace: Duration) -> Result<usize, StoreError> {
        let cutoff = format_ts(cutoff(Utc::now(), grace));
        let removed = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM sessions
                     WHERE COALESCE(presenter_disconnected_at, updated_at) <= ?1",
                    params![cutoff],
                )?)
            })
            .await?;
        if removed > 0 {
            debug!(removed, "expired session records deleted");
        }
        Ok(removed)
    }
}
