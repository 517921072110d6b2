//! Persistence of the archive index.
//!
//! The index maps archive keys to their durable directory and writability so
//! archives can be resumed after a restart. [`SqliteRecordStore`] is the
//! production store; [`MemoryRecordStore`] backs tests.

pub mod sqlite;
pub mod store;

pub use sqlite::SqliteRecordStore;
pub use store::{
    MemoryRecordStore, PersistedRecord, RecordQuery, RecordStore, StoreError, StoreResult,
};
