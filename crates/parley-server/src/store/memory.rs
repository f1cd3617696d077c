//! In-process session store (default when no database is configured).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use parley_core::SessionCode;

use super::{SessionRecord, SessionStore, StoreError};

/// Session records held in a map.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<SessionCode, SessionRecord>>,
}

impl MemorySessionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        if records
            .get(&record.code)
            .is_some_and(|existing| existing.updated_at > record.updated_at)
        {
            return Ok(());
        }
        let _ = records.insert(record.code.clone(), record.clone());
        Ok(())
    }

    async fn find_by_code(&self, code: &SessionCode) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.lock().get(code).cloned())
    }

    async fn delete_expired(&self, grace: Duration) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.is_expired_at(now, grace));
        Ok(before - records.len())
    }
}
