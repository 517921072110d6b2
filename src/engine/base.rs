//! Per-archive state shared by the engine implementations.

use super::content::{complete_stats, ContentStore, FileEntry};
use super::keys;
use super::traits::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Local content, remote manifest, and notification channel of one archive.
pub struct ArchiveCore {
    pub key: ArchiveKey,
    pub writable: bool,
    pub storage: StorageLocation,
    pub sparse: bool,
    pub content: Arc<ContentStore>,
    /// Remote file tree and version, once synced.
    manifest: Mutex<Option<(Vec<FileEntry>, u64)>>,
    has_metadata: AtomicBool,
    stats: Mutex<ArchiveStats>,
    events: broadcast::Sender<ArchiveEvent>,
    closed: AtomicBool,
}

impl ArchiveCore {
    /// Open content for `options` and resolve writability from the secret dir.
    pub async fn open(options: ArchiveOptions) -> EngineResult<Self> {
        let writable = match &options.secret_dir {
            Some(dir) => keys::holds_secret(dir, &options.key).await,
            None => false,
        };
        let content = match &options.storage {
            StorageLocation::Durable(path) => ContentStore::open_disk(path, &options.key).await?,
            StorageLocation::Volatile => ContentStore::memory(),
        };
        let (events, _) = broadcast::channel(256);

        let core = Self {
            key: options.key,
            writable,
            has_metadata: AtomicBool::new(writable || options.storage.is_durable()),
            storage: options.storage,
            sparse: options.sparse,
            content: Arc::new(content),
            manifest: Mutex::new(None),
            stats: Mutex::new(ArchiveStats::default()),
            events,
            closed: AtomicBool::new(false),
        };
        core.refresh_stats().await?;
        Ok(core)
    }

    pub fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn has_metadata(&self) -> bool {
        self.has_metadata.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> ArchiveStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn manifest(&self) -> Option<(Vec<FileEntry>, u64)> {
        self.manifest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn refresh_stats(&self) -> EngineResult<ArchiveStats> {
        let local = self.content.list().await?;
        let stats = match self.manifest() {
            Some((entries, version)) => {
                let mut stats = complete_stats(&entries, version);
                stats.downloaded = entries
                    .iter()
                    .filter(|e| local.iter().any(|l| l.path == e.path))
                    .map(|e| blocks_for(e.len))
                    .sum();
                stats
            }
            None => complete_stats(&local, self.content.version()),
        };
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = stats;
        Ok(stats)
    }

    /// Record a remote file tree and announce it.
    pub async fn apply_manifest(&self, entries: Vec<FileEntry>, version: u64) -> EngineResult<()> {
        *self.manifest.lock().unwrap_or_else(|e| e.into_inner()) = Some((entries, version));
        self.has_metadata.store(true, Ordering::SeqCst);
        let stats = self.refresh_stats().await?;
        let _ = self.events.send(ArchiveEvent::MetadataSynced { version });
        let _ = self.events.send(ArchiveEvent::Update(stats));
        Ok(())
    }

    /// Paths of the remote tree when known, else of local content.
    pub async fn list_files(&self) -> EngineResult<Vec<String>> {
        self.ensure_open()?;
        let entries = match self.manifest() {
            Some((entries, _)) => entries,
            None => self.content.list().await?,
        };
        Ok(entries.into_iter().map(|e| e.path).collect())
    }

    /// Store locally and publish updated stats.
    pub async fn store(&self, path: &str, data: &[u8]) -> EngineResult<()> {
        self.content.write(path, data).await?;
        let stats = self.refresh_stats().await?;
        let _ = self.events.send(ArchiveEvent::Update(stats));
        Ok(())
    }

    pub async fn write_file(&self, path: &str, data: &[u8]) -> EngineResult<()> {
        self.ensure_open()?;
        if !self.writable {
            return Err(EngineError::NotWritable(self.key));
        }
        self.store(path, data).await
    }

    /// Local copy of `path`, if held.
    pub async fn read_local(&self, path: &str) -> EngineResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.content.read(path).await
    }
}
