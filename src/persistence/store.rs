//! Durable index of known archives.
//!
//! One [`PersistedRecord`] per durable archive, keyed uniquely by archive key.
//! Records are written when a create or download completes and deleted on
//! remove; `resume_all` reads them back after a restart.

use crate::engine::ArchiveKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Index entry for one durable archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub key: ArchiveKey,
    pub path: PathBuf,
    pub writable: bool,
    /// Secret directory the archive was opened with, when not the default.
    #[serde(default)]
    pub secret_dir: Option<PathBuf>,
}

impl PersistedRecord {
    pub fn new(key: ArchiveKey, path: impl Into<PathBuf>, writable: bool) -> Self {
        Self {
            key,
            path: path.into(),
            writable,
            secret_dir: None,
        }
    }

    pub fn with_secret_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.secret_dir = dir;
        self
    }
}

/// Record selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordQuery {
    All,
    Key(ArchiveKey),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Record store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Database(e) => matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)),
            _ => false,
        }
    }
}

/// Persistence collaborator for the archive index.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records matching `query`, ordered by key.
    async fn find(&self, query: RecordQuery) -> StoreResult<Vec<PersistedRecord>>;

    /// Insert or replace the record for `record.key`.
    async fn upsert(&self, record: &PersistedRecord) -> StoreResult<()>;

    /// Delete the record for `key`. Returns whether one existed.
    async fn remove(&self, key: &ArchiveKey) -> StoreResult<bool>;

    async fn close(&self) -> StoreResult<()>;

    async fn find_one(&self, key: &ArchiveKey) -> StoreResult<Option<PersistedRecord>> {
        Ok(self.find(RecordQuery::Key(*key)).await?.into_iter().next())
    }
}

/// In-memory record store for testing.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<ArchiveKey, PersistedRecord>>,
    closed: AtomicBool,
    failing_writes: AtomicU32,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Insert a record directly (for test setup).
    pub fn insert(&self, record: PersistedRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.key, record);
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn check_write(&self) -> StoreResult<()> {
        self.ensure_open()?;
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find(&self, query: RecordQuery) -> StoreResult<Vec<PersistedRecord>> {
        self.ensure_open()?;
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(match query {
            RecordQuery::All => records.values().cloned().collect(),
            RecordQuery::Key(key) => records.get(&key).cloned().into_iter().collect(),
        })
    }

    async fn upsert(&self, record: &PersistedRecord) -> StoreResult<()> {
        self.check_write()?;
        self.insert(record.clone());
        Ok(())
    }

    async fn remove(&self, key: &ArchiveKey) -> StoreResult<bool> {
        self.check_write()?;
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some())
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
