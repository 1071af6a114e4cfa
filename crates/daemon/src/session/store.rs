//! Persisted session record store interface.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use super::types::{Session, SessionPatch};

/// Errors from a record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt session record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("session record already exists: {0}")]
    Duplicate(String),

    #[error("session record not found: {0}")]
    Missing(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Durable session records, keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn select(&self, id: &str) -> Result<Option<Session>, StoreError>;

    async fn select_all(&self) -> Result<Vec<Session>, StoreError>;

    /// Inserts a new record; an existing id is [`StoreError::Duplicate`].
    async fn insert(&self, session: &Session) -> Result<(), StoreError>;

    /// Applies a partial update; an unknown id is [`StoreError::Missing`].
    async fn update(&self, id: &str, patch: &SessionPatch) -> Result<(), StoreError>;
}

/// In-memory [`SessionStore`], used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, Session>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn select(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn select_all(&self) -> Result<Vec<Session>, StoreError> {
        let mut all: Vec<Session> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn insert(&self, session: &Session) -> Result<(), StoreError> {
        match self.records.entry(session.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::Duplicate(session.id.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, id: &str, patch: &SessionPatch) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::Missing(id.to_string()))?;
        record.apply(patch);
        Ok(())
    }
}
