//! Session record persistence.
//!
//! The directory works purely in memory; a [`SessionStore`] only keeps
//! records around for cold-start reattachment and analytics. Store failures
//! are logged by callers and never block the hot path.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{SessionCode, SessionSettings};
use serde::{Deserialize, Serialize};

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

/// Errors from a session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection pool failure.
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    /// `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Stored JSON could not be read.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// A stored value is malformed.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// The blocking task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),
}

/// Persisted view of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Join code.
    pub code: SessionCode,
    /// Stable presenter identity, if the presenter supplied one.
    pub presenter_key: Option<String>,
    /// Presenter language.
    pub source_language: String,
    /// Presenter-owned settings.
    pub settings: SessionSettings,
    /// Listeners at the time of the write.
    pub listener_count: usize,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the presenter went away, if it did.
    pub presenter_disconnected_at: Option<DateTime<Utc>>,
    /// Time of this write.
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Last moment the presenter was known to be present.
    pub fn last_active(&self) -> DateTime<Utc> {
        self.presenter_disconnected_at.unwrap_or(self.updated_at)
    }

    /// Whether the record is past the grace period at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        elapsed_since(self.last_active(), now) >= grace
    }
}

/// Non-negative elapsed time between two instants.
pub(crate) fn elapsed_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// Cutoff timestamp for a grace period ending at `now`.
pub(crate) fn cutoff(now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(grace)
        .ok()
        .and_then(|g| now.checked_sub_signed(g))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Persistence collaborator.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace a record. A record older than the stored one
    /// (by `updated_at`) is ignored.
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Look up a record by code.
    async fn find_by_code(&self, code: &SessionCode) -> Result<Option<SessionRecord>, StoreError>;

    /// Delete records idle longer than `grace`. Returns the number removed.
    async fn delete_expired(&self, grace: Duration) -> Result<usize, StoreError>;
}

#[cfg(test)]
pub(crate) fn sample_record(code: &str) -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        code: SessionCode::parse(code).unwrap(),
        presenter_key: Some("teacher-1".into()),
        source_language: "en-US".into(),
        settings: SessionSettings::default(),
        listener_count: 0,
        created_at: now,
        presenter_disconnected_at: None,
        updated_at: now,
    }
}
