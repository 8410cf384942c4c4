//! Record store interface consumed by sync.
//!
//! Sync only ever reads and writes whole records through this trait; the
//! storage engine behind it is the application's business. [`MemoryStore`]
//! is a concurrent in-memory implementation used by tests and the demo.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;
use sync_types::{KeyParts, ScoutingRecord};
use thiserror::Error;

/// Record store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Id-keyed record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch one record by id.
    async fn get(&self, id: &str) -> Result<Option<ScoutingRecord>, StoreError>;

    /// Fetch several records by id; missing ids are skipped.
    ///
    /// Stores that can batch lookups should override this.
    async fn get_many(&self, ids: &[String]) -> Result<Vec<ScoutingRecord>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(id).await? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Insert or replace a record under its storage id.
    async fn put(&self, record: ScoutingRecord) -> Result<(), StoreError>;

    /// Insert or replace several records.
    async fn put_many(&self, records: Vec<ScoutingRecord>) -> Result<(), StoreError> {
        for record in records {
            self.put(record).await?;
        }
        Ok(())
    }

    /// Records whose composite key parts match `parts`.
    async fn query_by_composite_key(
        &self,
        parts: &KeyParts,
    ) -> Result<Vec<ScoutingRecord>, StoreError>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, ScoutingRecord>,
    fail_next_put: Mutex<Option<String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `records`.
    pub fn with_records(records: impl IntoIterator<Item = ScoutingRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.storage_id(), record);
        }
        store
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every record, sorted by id.
    pub fn snapshot(&self) -> Vec<ScoutingRecord> {
        let mut all: Vec<ScoutingRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Cause the next `put()` to fail with the given error.
    pub fn fail_next_put(&self, error: &str) {
        *self.fail_next_put.lock().unwrap() = Some(error.to_string());
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<ScoutingRecord>, StoreError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn put(&self, record: ScoutingRecord) -> Result<(), StoreError> {
        if let Some(error) = self.fail_next_put.lock().unwrap().take() {
            return Err(StoreError::Backend(error));
        }
        let mut record = record;
        record.id = record.storage_id();
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn query_by_composite_key(
        &self,
        parts: &KeyParts,
    ) -> Result<Vec<ScoutingRecord>, StoreError> {
        let mut found: Vec<ScoutingRecord> = self
            .records
            .iter()
            .filter(|r| parts.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}
