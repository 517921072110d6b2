//! SQLite-backed record store.

use super::store::{PersistedRecord, RecordQuery, RecordStore, StoreError, StoreResult};
use crate::engine::ArchiveKey;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS archives (
    key TEXT PRIMARY KEY NOT NULL,
    path TEXT NOT NULL,
    writable INTEGER NOT NULL,
    secret_dir TEXT
)";

/// Archive index in a SQLite database file.
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// Private in-memory database.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // A single long-lived connection keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> StoreResult<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('archives')")
            .fetch_all(&pool)
            .await?;
        if !columns.iter().any(|c| c == "secret_dir") {
            sqlx::query("ALTER TABLE archives ADD COLUMN secret_dir TEXT")
                .execute(&pool)
                .await?;
            tracing::info!("added secret_dir column to archive index");
        }
        tracing::debug!("archive index ready");
        Ok(Self { pool })
    }
}

/// Paths are stored as text; anything that does not round-trip is refused.
fn path_text(path: &Path) -> StoreResult<&str> {
    path.to_str()
        .ok_or_else(|| StoreError::Corrupt(format!("path is not UTF-8: {}", path.display())))
}

fn record_from_row(row: &SqliteRow) -> StoreResult<PersistedRecord> {
    let key: String = row.try_get("key")?;
    let path: String = row.try_get("path")?;
    let writable: i64 = row.try_get("writable")?;
    let secret_dir: Option<String> = row.try_get("secret_dir")?;
    let key = ArchiveKey::from_hex(&key).map_err(|e| StoreError::Corrupt(format!("{}: {}", key, e)))?;
    Ok(PersistedRecord {
        key,
        path: PathBuf::from(path),
        writable: writable != 0,
        secret_dir: secret_dir.map(PathBuf::from),
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn find(&self, query: RecordQuery) -> StoreResult<Vec<PersistedRecord>> {
        let rows = match query {
            RecordQuery::All => {
                sqlx::query("SELECT key, path, writable, secret_dir FROM archives ORDER BY key")
                    .fetch_all(&self.pool)
                    .await?
            }
            RecordQuery::Key(key) => {
                sqlx::query("SELECT key, path, writable, secret_dir FROM archives WHERE key = ?")
                    .bind(key.to_hex())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(record_from_row).collect()
    }

    async fn upsert(&self, record: &PersistedRecord) -> StoreResult<()> {
        let path = path_text(&record.path)?;
        let secret_dir = record.secret_dir.as_deref().map(path_text).transpose()?;
        sqlx::query(
            "INSERT INTO archives (key, path, writable, secret_dir) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET path = excluded.path,
                 writable = excluded.writable, secret_dir = excluded.secret_dir",
        )
        .bind(record.key.to_hex())
        .bind(path)
        .bind(record.writable as i64)
        .bind(secret_dir)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &ArchiveKey) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM archives WHERE key = ?")
            .bind(key.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(byte: u8) -> ArchiveKey {
        ArchiveKey::from_bytes(&[byte; 32]).unwrap()
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("dbs").join("archives.db");

        let store = SqliteRecordStore::open(&db).await.unwrap();
        store
            .upsert(&PersistedRecord::new(key(1), "/content/1", true))
            .await
            .unwrap();
        store
            .upsert(&PersistedRecord::new(key(2), "/content/2", false))
            .await
            .unwrap();
        store.close().await.unwrap();

        let reopened = SqliteRecordStore::open(&db).await.unwrap();
        let all = reopened.find(RecordQuery::All).await.unwrap();
        assert_eq!(
            all,
            vec![
                PersistedRecord::new(key(1), "/content/1", true),
                PersistedRecord::new(key(2), "/content/2", false),
            ]
        );
    }

    #[tokio::test]
    async fn test_upsert_updates_existing_key() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        store
            .upsert(&PersistedRecord::new(key(1), "/old", false))
            .await
            .unwrap();
        store
            .upsert(&PersistedRecord::new(key(1), "/new", true))
            .await
            .unwrap();

        let found = store.find_one(&key(1)).await.unwrap().unwrap();
        assert_eq!(found.path, PathBuf::from("/new"));
        assert!(found.writable);
        assert_eq!(store.find(RecordQuery::All).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        store
            .upsert(&PersistedRecord::new(key(1), "/a", false))
            .await
            .unwrap();
        assert!(store.remove(&key(1)).await.unwrap());
        assert!(!store.remove(&key(1)).await.unwrap());
        assert!(store.find(RecordQuery::Key(key(1))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_secret_dir_round_trips() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let record = PersistedRecord::new(key(3), "/content/3", true)
            .with_secret_dir(Some(PathBuf::from("/vault")));
        store.upsert(&record).await.unwrap();
        store
            .upsert(&PersistedRecord::new(key(4), "/content/4", true))
            .await
            .unwrap();

        assert_eq!(store.find_one(&key(3)).await.unwrap().unwrap(), record);
        assert_eq!(store.find_one(&key(4)).await.unwrap().unwrap().secret_dir, None);
    }

    #[tokio::test]
    async fn test_index_without_secret_dir_column_is_upgraded() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("archives.db");
        let options = SqliteConnectOptions::new().filename(&db).create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
        sqlx::query(
            "CREATE TABLE archives (key TEXT PRIMARY KEY NOT NULL, path TEXT NOT NULL, writable INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO archives (key, path, writable) VALUES (?, '/old', 1)")
            .bind(key(5).to_hex())
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let store = SqliteRecordStore::open(&db).await.unwrap();
        assert_eq!(
            store.find(RecordQuery::All).await.unwrap(),
            vec![PersistedRecord::new(key(5), "/old", true)]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_path_is_refused() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let store = SqliteRecordStore::in_memory().await.unwrap();
        let path = PathBuf::from(OsStr::from_bytes(b"/content/\xff"));
        let result = store.upsert(&PersistedRecord::new(key(6), path, false)).await;
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
        assert!(store.find_one(&key(6)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_key_is_reported() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        sqlx::query("INSERT INTO archives (key, path, writable) VALUES ('zz', '/x', 0)")
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(matches!(
            store.find(RecordQuery::All).await,
            Err(StoreError::Corrupt(_))
        ));
    }
}
