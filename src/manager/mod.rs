//! Archive manager.
//!
//! Top-level façade over the engine, port allocator, join coordinator, retry
//! loop, registry, and record store. Every mutating outcome is written to the
//! record store before the operation reports success.

pub mod download;

pub use download::{DownloadAttemptState, DownloadOptions, DownloadPhase};

use crate::config::ManagerConfig;
use crate::engine::{
    marker_exists, ArchiveEngine, ArchiveKey, ArchiveOptions, ImportSummary, LocalEngine,
};
use crate::error::{ManagerError, ManagerResult};
use crate::handle::{ArchiveHandle, ArchiveStatus};
use crate::network::{JoinCoordinator, JoinMode, PeerConnector};
use crate::persistence::{
    PersistedRecord, RecordQuery, RecordStore, SqliteRecordStore, StoreError,
};
use crate::ports::{PortAllocator, PortPool};
use crate::registry::{Claim, Registry};
use crate::retry::{retry_with_backoff, RetryPolicy};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options for [`ArchiveManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Where to store the new private key (defaults to `data/secrets`).
    pub secret_dir: Option<PathBuf>,
}

/// Outcome of [`ArchiveManager::resume_all`].
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub resumed: Vec<ArchiveKey>,
    /// Records whose archive was already live.
    pub skipped: Vec<ArchiveKey>,
    /// Resumed, but recorded as writable and reopened without its secret key.
    pub read_only: Vec<ArchiveKey>,
    pub failed: Vec<(ArchiveKey, ManagerError)>,
}

impl ResumeReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.read_only.is_empty()
    }
}

/// Lifecycle manager for replicated archives.
#[derive(Clone)]
pub struct ArchiveManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    engine: Arc<dyn ArchiveEngine>,
    store: Arc<dyn RecordStore>,
    registry: Registry,
    coordinator: JoinCoordinator,
    connector: PeerConnector,
    retry: RetryPolicy,
}

impl ArchiveManager {
    pub fn new(
        config: ManagerConfig,
        engine: Arc<dyn ArchiveEngine>,
        store: Arc<dyn RecordStore>,
    ) -> ManagerResult<Self> {
        Self::with_retry_policy(config, engine, store, RetryPolicy::default())
    }

    /// Create with a custom backoff for record store writes.
    pub fn with_retry_policy(
        config: ManagerConfig,
        engine: Arc<dyn ArchiveEngine>,
        store: Arc<dyn RecordStore>,
        retry: RetryPolicy,
    ) -> ManagerResult<Self> {
        config.validate()?;
        let ports = PortAllocator::new(config.network.upload_ports, config.network.download_ports);
        let coordinator = JoinCoordinator::new(ports);
        let connector = PeerConnector::new(coordinator.clone(), config.network.connectivity());

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                engine,
                store,
                registry: Registry::new(),
                coordinator,
                connector,
                retry,
            }),
        })
    }

    /// Open the SQLite index under the storage root and use `engine`.
    pub async fn open(config: ManagerConfig, engine: Arc<dyn ArchiveEngine>) -> ManagerResult<Self> {
        let store = SqliteRecordStore::open(&config.db_path()).await?;
        tracing::info!(storage = %config.storage.path.display(), "archive index opened");
        Self::new(config, engine, Arc::new(store))
    }

    /// Open with the local TCP engine.
    pub async fn open_local(config: ManagerConfig) -> ManagerResult<Self> {
        let engine = Arc::new(LocalEngine::new(config.announce_dir()));
        Self::open(config, engine).await
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn ports(&self) -> &PortAllocator {
        self.inner.coordinator.ports()
    }

    fn secret_dir(&self, requested: Option<&PathBuf>) -> PathBuf {
        requested
            .cloned()
            .unwrap_or_else(|| self.inner.config.secret_dir())
    }

    /// Record for a durable archive. Only a non-default secret dir is kept.
    fn record_for(
        &self,
        key: ArchiveKey,
        dir: &Path,
        writable: bool,
        secret_dir: &Path,
    ) -> PersistedRecord {
        let custom = (secret_dir != self.inner.config.secret_dir().as_path())
            .then(|| secret_dir.to_path_buf());
        PersistedRecord::new(key, dir, writable).with_secret_dir(custom)
    }

    /// Create a writable archive holding the contents of `src`.
    pub async fn create(&self, src: &Path, options: CreateOptions) -> ManagerResult<ArchiveHandle> {
        if !tokio::fs::try_exists(src).await? {
            return Err(ManagerError::InvalidPath(src.display().to_string()));
        }
        let secret_dir = self.secret_dir(options.secret_dir.as_ref());
        let key = self.inner.engine.generate_key(&secret_dir).await?;
        let dir = self.inner.config.archive_dir(&key);
        tracing::info!(key = %key, path = %dir.display(), "creating archive");

        let archive = match self
            .inner
            .engine
            .open_archive(ArchiveOptions::durable(key, &dir).with_secret_dir(&secret_dir))
            .await
        {
            Ok(archive) => archive,
            Err(e) => {
                self.delete_dir(&dir).await;
                return Err(e.into());
            }
        };
        let handle = ArchiveHandle::new(archive);

        match self.populate(&handle, src, &dir, &secret_dir).await {
            Ok(summary) => {
                tracing::info!(
                    key = %key,
                    files = summary.files.len(),
                    bytes = summary.bytes,
                    port = ?handle.port(),
                    "archive created"
                );
                self.inner.registry.replace(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "create failed");
                handle.close_quietly().await;
                self.delete_dir(&dir).await;
                Err(e)
            }
        }
    }

    async fn populate(
        &self,
        handle: &ArchiveHandle,
        src: &Path,
        dir: &Path,
        secret_dir: &Path,
    ) -> ManagerResult<ImportSummary> {
        let summary = handle.archive().import_files(src).await?;
        let network = self
            .inner
            .coordinator
            .join(
                handle.archive().as_ref(),
                JoinMode::ResolveOnListening,
                PortPool::Upload,
                None,
            )
            .await?;
        handle.attach_network(network);
        self.persist(&self.record_for(handle.key(), dir, true, secret_dir))
            .await?;
        Ok(summary)
    }

    /// Live handle for `key`, loading it from disk (without joining) if needed.
    pub async fn get(&self, key: ArchiveKey) -> ManagerResult<ArchiveHandle> {
        if let Some(handle) = self.inner.registry.get(&key) {
            return Ok(handle);
        }
        let dir = self.inner.config.archive_dir(&key);
        if !marker_exists(&dir) {
            return Err(ManagerError::NotFound(key.to_hex()));
        }

        let record = self.inner.store.find_one(&key).await?;
        let secret_dir = self.secret_dir(record.as_ref().and_then(|r| r.secret_dir.as_ref()));
        let archive = self
            .inner
            .engine
            .open_archive(ArchiveOptions::durable(key, &dir).with_secret_dir(secret_dir))
            .await?;
        let handle = ArchiveHandle::new(archive);
        match self.inner.registry.claim(handle.clone()) {
            Claim::Inserted => {
                tracing::debug!(key = %key, "loaded archive from disk");
                Ok(handle)
            }
            Claim::Existing(existing) => {
                handle.close_quietly().await;
                Ok(existing)
            }
        }
    }

    /// Live handle for `key`, if any. Never touches disk.
    pub fn handle(&self, key: &ArchiveKey) -> Option<ArchiveHandle> {
        self.inner.registry.get(key)
    }

    /// Import a file or directory into a writable archive.
    pub async fn import_files(&self, key: ArchiveKey, src: &Path) -> ManagerResult<ImportSummary> {
        let handle = self.get(key).await?;
        if !handle.writable() {
            return Err(ManagerError::NotWritable(key));
        }
        if !tokio::fs::try_exists(src).await? {
            return Err(ManagerError::InvalidPath(src.display().to_string()));
        }
        let summary = handle.archive().import_files(src).await?;
        tracing::info!(key = %key, files = summary.files.len(), bytes = summary.bytes, "files imported");
        Ok(summary)
    }

    /// Close the archive and delete its record and directory.
    ///
    /// The private key is kept.
    pub async fn remove(&self, key: ArchiveKey) -> ManagerResult<()> {
        let handle = self.inner.registry.remove(&key);
        if let Some(handle) = &handle {
            handle.close_quietly().await;
        }
        let had_record = self.forget(&key).await?;
        let dir = self.inner.config.archive_dir(&key);
        let had_dir = tokio::fs::try_exists(&dir).await?;

        if handle.is_none() && !had_record && !had_dir {
            return Err(ManagerError::NotFound(key.to_hex()));
        }
        if had_dir {
            tokio::time::sleep(self.inner.config.removal.grace).await;
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tracing::info!(key = %key, "archive removed");
        Ok(())
    }

    /// Close `handle` (if still live), delete the record and the directory.
    /// Failures are logged.
    pub(crate) async fn purge(&self, key: ArchiveKey, handles: &[&ArchiveHandle]) {
        for handle in handles {
            self.inner.registry.remove_instance(handle);
            handle.close_quietly().await;
        }
        if let Err(e) = self.forget(&key).await {
            tracing::warn!(key = %key, error = %e, "failed to delete archive record");
        }
        let dir = self.inner.config.archive_dir(&key);
        if matches!(tokio::fs::try_exists(&dir).await, Ok(true)) {
            tokio::time::sleep(self.inner.config.removal.grace).await;
            self.delete_dir(&dir).await;
        }
    }

    /// Rejoin every persisted archive that is not live.
    pub async fn resume_all(&self) -> ManagerResult<ResumeReport> {
        let records = self.inner.store.find(RecordQuery::All).await?;
        let mut report = ResumeReport::default();

        for record in records {
            if self.inner.registry.contains(&record.key) {
                report.skipped.push(record.key);
                continue;
            }
            match self.resume(&record).await {
                Ok(handle) => {
                    tracing::info!(key = %record.key, port = ?handle.port(), "archive resumed");
                    if record.writable && !handle.writable() {
                        tracing::warn!(
                            key = %record.key,
                            secret_dir = ?record.secret_dir,
                            "secret key not found; archive resumed read-only"
                        );
                        report.read_only.push(record.key);
                    }
                    report.resumed.push(record.key);
                }
                Err(e) => {
                    tracing::warn!(key = %record.key, path = %record.path.display(), error = %e, "resume failed");
                    report.failed.push((record.key, e));
                }
            }
        }
        Ok(report)
    }

    async fn resume(&self, record: &PersistedRecord) -> ManagerResult<ArchiveHandle> {
        if !marker_exists(&record.path) {
            return Err(ManagerError::NotFound(record.path.display().to_string()));
        }
        let archive = self
            .inner
            .engine
            .open_archive(
                ArchiveOptions::durable(record.key, &record.path)
                    .with_secret_dir(self.secret_dir(record.secret_dir.as_ref())),
            )
            .await?;
        let handle = ArchiveHandle::new(archive);
        let network = self
            .inner
            .coordinator
            .join(
                handle.archive().as_ref(),
                JoinMode::ResolveOnListening,
                PortPool::Upload,
                None,
            )
            .await;
        let network = match network {
            Ok(network) => network,
            Err(e) => {
                handle.close_quietly().await;
                return Err(e);
            }
        };
        handle.attach_network(network);

        match self.inner.registry.claim(handle.clone()) {
            Claim::Inserted => Ok(handle),
            Claim::Existing(existing) => {
                handle.close_quietly().await;
                Ok(existing)
            }
        }
    }

    /// Close every live archive, then the record store.
    pub async fn close(&self) -> ManagerResult<()> {
        let handles = self.inner.registry.drain();
        tracing::info!(archives = handles.len(), "closing archives");
        for handle in handles {
            handle.close_quietly().await;
        }
        self.inner.store.close().await?;
        Ok(())
    }

    /// Every persisted record, ordered by key.
    pub async fn list(&self) -> ManagerResult<Vec<PersistedRecord>> {
        Ok(self.inner.store.find(RecordQuery::All).await?)
    }

    pub async fn stats(&self, key: ArchiveKey) -> ManagerResult<ArchiveStatus> {
        Ok(self.get(key).await?.status())
    }

    pub async fn read_file(&self, key: ArchiveKey, path: &str) -> ManagerResult<Vec<u8>> {
        let handle = self.get(key).await?;
        Ok(handle.archive().read_file(path).await?)
    }

    /// True if the archive is live, recorded, or on disk.
    pub async fn exists(&self, key: ArchiveKey) -> ManagerResult<bool> {
        if self.inner.registry.contains(&key) {
            return Ok(true);
        }
        if self.inner.store.find_one(&key).await?.is_some() {
            return Ok(true);
        }
        Ok(tokio::fs::try_exists(self.inner.config.archive_dir(&key)).await?)
    }

    /// Download progress of the live handle for `key`.
    pub fn progress(&self, key: &ArchiveKey) -> Option<f64> {
        self.inner.registry.get(key).map(|h| h.progress())
    }

    /// Keys of every live archive.
    pub fn live_keys(&self) -> Vec<ArchiveKey> {
        self.inner
            .registry
            .all()
            .iter()
            .map(ArchiveHandle::key)
            .collect()
    }

    async fn persist(&self, record: &PersistedRecord) -> ManagerResult<()> {
        let store = self.inner.store.as_ref();
        retry_with_backoff(
            &self.inner.retry,
            move || store.upsert(record),
            StoreError::is_transient,
        )
        .await?;
        tracing::debug!(key = %record.key, path = %record.path.display(), "record saved");
        Ok(())
    }

    async fn forget(&self, key: &ArchiveKey) -> ManagerResult<bool> {
        let store = self.inner.store.as_ref();
        Ok(retry_with_backoff(
            &self.inner.retry,
            move || store.remove(key),
            StoreError::is_transient,
        )
        .await?)
    }

    async fn delete_dir(&self, dir: &Path) {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "failed to delete archive directory")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::engine::Archive;
    use crate::persistence::MemoryRecordStore;
    use crate::ports::PortRange;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ManagerConfig {
        let mut config = ManagerConfig::new(dir.path().to_path_buf());
        config.network.upload_ports = PortRange::new(7000, 7010);
        config.network.download_ports = PortRange::new(7100, 7110);
        config.removal.grace = Duration::from_millis(5);
        config
    }

    fn manager(dir: &TempDir) -> (ArchiveManager, MockEngine, Arc<MemoryRecordStore>) {
        let engine = MockEngine::new();
        let store = Arc::new(MemoryRecordStore::new());
        let manager =
            ArchiveManager::new(config(dir), Arc::new(engine.clone()), store.clone()).unwrap();
        (manager, engine, store)
    }

    fn source(dir: &TempDir) -> PathBuf {
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();
        std::fs::write(src.join("b.txt"), b"beta").unwrap();
        src
    }

    #[tokio::test]
    async fn test_create_registers_joins_and_persists() {
        let dir = TempDir::new().unwrap();
        let (manager, _engine, store) = manager(&dir);

        let handle = manager.create(&source(&dir), CreateOptions::default()).await.unwrap();
        let key = handle.key();
        assert!(handle.writable());
        assert_eq!(handle.port(), Some(7000));
        assert_eq!(handle.progress(), 1.0);

        let record = store.find_one(&key).await.unwrap().unwrap();
        assert_eq!(record.path, manager.config().archive_dir(&key));
        assert!(record.writable);
        assert!(marker_exists(&record.path));
        assert_eq!(manager.read_file(key, "b.txt").await.unwrap(), b"beta");
    }

    #[tokio::test]
    async fn test_create_rejects_missing_source() {
        let dir = TempDir::new().unwrap();
        let (manager, _engine, _store) = manager(&dir);
        let result = manager
            .create(&dir.path().join("nope"), CreateOptions::default())
            .await;
        assert!(matches!(result, Err(ManagerError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_create_rolls_back_when_store_fails() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        let manager = ArchiveManager::with_retry_policy(
            config(&dir),
            Arc::new(MockEngine::new()),
            store.clone(),
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        )
        .unwrap();
        store.fail_next_writes(5);

        let result = manager.create(&source(&dir), CreateOptions::default()).await;
        assert!(matches!(result, Err(ManagerError::Store(_))));
        assert!(manager.live_keys().is_empty());
        assert!(manager.ports().in_use(PortPool::Upload).is_empty());
        let content = std::fs::read_dir(manager.config().content_dir()).unwrap();
        assert_eq!(content.count(), 0);
    }

    #[tokio::test]
    async fn test_store_writes_are_retried() {
        let dir = TempDir::new().unwrap();
        let (manager, _engine, store) = manager(&dir);
        store.fail_next_writes(2);

        let handle = manager.create(&source(&dir), CreateOptions::default()).await.unwrap();
        assert!(store.find_one(&handle.key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_loads_from_disk_without_joining() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, store) = manager(&dir);
        let key = manager
            .create(&source(&dir), CreateOptions::default())
            .await
            .unwrap()
            .key();
        let record = store.find_one(&key).await.unwrap().unwrap();
        manager.close().await.unwrap();

        let store = Arc::new(MemoryRecordStore::new());
        store.insert(record);
        let reopened =
            ArchiveManager::new(config(&dir), Arc::new(engine), store).unwrap();
        let handle = reopened.get(key).await.unwrap();
        assert!(handle.writable());
        assert!(!handle.is_joined());
        assert!(reopened.get(key).await.unwrap().same_instance(&handle));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (manager, _engine, _store) = manager(&dir);
        let key = ArchiveKey::from_bytes(&[1u8; 32]).unwrap();
        assert!(matches!(manager.get(key).await, Err(ManagerError::NotFound(_))));
        assert!(!manager.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_import_overwrites_existing_file() {
        let dir = TempDir::new().unwrap();
        let (manager, _engine, _store) = manager(&dir);
        let key = manager
            .create(&source(&dir), CreateOptions::default())
            .await
            .unwrap()
            .key();

        let update = dir.path().join("a.txt");
        std::fs::write(&update, b"alpha v2").unwrap();
        let summary = manager.import_files(key, &update).await.unwrap();
        assert_eq!(summary.files, vec!["a.txt"]);

        assert_eq!(manager.read_file(key, "a.txt").await.unwrap(), b"alpha v2");
        assert_eq!(manager.read_file(key, "b.txt").await.unwrap(), b"beta");
    }

    #[tokio::test]
    async fn test_import_preconditions() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, _store) = manager(&dir);
        let unknown = ArchiveKey::from_bytes(&[2u8; 32]).unwrap();
        assert!(matches!(
            manager.import_files(unknown, dir.path()).await,
            Err(ManagerError::NotFound(_))
        ));

        let key = manager
            .create(&source(&dir), CreateOptions::default())
            .await
            .unwrap()
            .key();
        assert!(matches!(
            manager.import_files(key, &dir.path().join("missing")).await,
            Err(ManagerError::InvalidPath(_))
        ));

        // Durable archive whose secret is not held.
        let read_only = ArchiveKey::from_bytes(&[3u8; 32]).unwrap();
        let archive = engine
            .open_archive(ArchiveOptions::durable(
                read_only,
                manager.config().archive_dir(&read_only),
            ))
            .await
            .unwrap();
        archive.close().await.unwrap();
        assert!(matches!(
            manager.import_files(read_only, dir.path()).await,
            Err(ManagerError::NotWritable(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_deletes_everything_but_secret() {
        let dir = TempDir::new().unwrap();
        let (manager, _engine, store) = manager(&dir);
        let handle = manager.create(&source(&dir), CreateOptions::default()).await.unwrap();
        let key = handle.key();

        manager.remove(key).await.unwrap();
        assert!(handle.is_closed());
        assert!(!manager.config().archive_dir(&key).exists());
        assert!(store.find_one(&key).await.unwrap().is_none());
        assert!(!manager.exists(key).await.unwrap());
        assert!(manager.ports().in_use(PortPool::Upload).is_empty());
        assert!(crate::engine::keys::secret_path(&manager.config().secret_dir(), &key).exists());

        assert!(matches!(
            manager.remove(key).await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_all_continues_past_broken_record() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, _store) = manager(&dir);
        let key = manager
            .create(&source(&dir), CreateOptions::default())
            .await
            .unwrap()
            .key();
        let broken = ArchiveKey::from_bytes(&[0u8; 32]).unwrap();
        manager.close().await.unwrap();

        let store = Arc::new(MemoryRecordStore::new());
        store.insert(PersistedRecord::new(key, manager.config().archive_dir(&key), true));
        store.insert(PersistedRecord::new(broken, dir.path().join("gone"), false));
        let restarted = ArchiveManager::new(config(&dir), Arc::new(engine), store).unwrap();

        let report = restarted.resume_all().await.unwrap();
        assert_eq!(report.resumed, vec![key]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, broken);

        let handle = restarted.handle(&key).unwrap();
        assert!(handle.is_joined());
        assert!(handle.writable());

        let again = restarted.resume_all().await.unwrap();
        assert_eq!(again.skipped, vec![key]);
    }

    #[tokio::test]
    async fn test_custom_secret_dir_survives_restart() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, store) = manager(&dir);
        let vault = dir.path().join("vault");
        let key = manager
            .create(
                &source(&dir),
                CreateOptions {
                    secret_dir: Some(vault.clone()),
                },
            )
            .await
            .unwrap()
            .key();
        let record = store.find_one(&key).await.unwrap().unwrap();
        assert_eq!(record.secret_dir, Some(vault.clone()));
        manager.close().await.unwrap();

        let store = Arc::new(MemoryRecordStore::new());
        store.insert(record.clone());
        let restarted =
            ArchiveManager::new(config(&dir), Arc::new(engine.clone()), store).unwrap();
        let report = restarted.resume_all().await.unwrap();
        assert_eq!(report.resumed, vec![key]);
        assert!(report.is_clean());
        assert!(restarted.handle(&key).unwrap().writable());

        let update = dir.path().join("c.txt");
        std::fs::write(&update, b"gamma").unwrap();
        restarted.import_files(key, &update).await.unwrap();
        restarted.close().await.unwrap();

        // Without the secret the archive still serves, but the report says so.
        std::fs::remove_dir_all(&vault).unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        store.insert(record);
        let downgraded = ArchiveManager::new(config(&dir), Arc::new(engine), store).unwrap();
        let report = downgraded.resume_all().await.unwrap();
        assert_eq!(report.resumed, vec![key]);
        assert_eq!(report.read_only, vec![key]);
        assert!(!report.is_clean());
        assert!(!downgraded.handle(&key).unwrap().writable());
    }

    #[tokio::test]
    async fn test_close_releases_all_ports() {
        let dir = TempDir::new().unwrap();
        let (manager, _engine, store) = manager(&dir);
        let first = manager.create(&source(&dir), CreateOptions::default()).await.unwrap();
        let second = manager.create(&source(&dir), CreateOptions::default()).await.unwrap();
        assert_ne!(first.port(), second.port());

        manager.close().await.unwrap();
        assert!(first.is_closed() && second.is_closed());
        assert!(manager.ports().in_use(PortPool::Upload).is_empty());
        assert!(store.find(RecordQuery::All).await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let dir = TempDir::new().unwrap();
        let (manager, _engine, _store) = manager(&dir);
        let key = manager
            .create(&source(&dir), CreateOptions::default())
            .await
            .unwrap()
            .key();

        let records = manager.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, key);

        let status = manager.stats(key).await.unwrap();
        assert_eq!(status.stats.files, 2);
        assert_eq!(status.stats.byte_length, 9);
        assert_eq!(status.progress, 1.0);
    }
}
