//! Download pipeline.
//!
//! A download stages the archive in volatile sparse storage, waits for a peer
//! and the remote file tree, mirrors the content into `<content>/<key>`, then
//! re-opens the archive against that directory and rejoins the network:
//!
//! ```text
//! StagingVolatile -> JoinNetwork -> AwaitPeerConnected -> [AwaitMetadataSync]
//!   -> MirrorToDisk -> RebindDurable -> RejoinNetwork -> Complete
//! ```
//!
//! With `resolve_on_start` the volatile handle is returned once a peer is
//! connected and the remaining phases run on a spawned task. Any failure after
//! staging closes the instances and deletes the record and the directory.

use super::ArchiveManager;
use crate::engine::{
    marker_exists, mirror, ArchiveEvent, ArchiveKey, ArchiveOptions, MirrorSummary,
};
use crate::error::{ManagerError, ManagerResult};
use crate::handle::ArchiveHandle;
use crate::ports::PortPool;
use crate::registry::Claim;
use futures::StreamExt;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use uuid::Uuid;

/// Options for [`ArchiveManager::download`].
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Return the volatile handle once a peer connects.
    pub resolve_on_start: bool,
    pub secret_dir: Option<PathBuf>,
    /// First port to try in the download pool.
    pub force_port: Option<u16>,
}

/// Pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    StagingVolatile,
    JoinNetwork,
    AwaitPeerConnected,
    AwaitMetadataSync,
    MirrorToDisk,
    RebindDurable,
    RejoinNetwork,
    Complete,
    ReturnEarly,
    FailedCleanup,
}

impl fmt::Display for DownloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StagingVolatile => "staging_volatile",
            Self::JoinNetwork => "join_network",
            Self::AwaitPeerConnected => "await_peer_connected",
            Self::AwaitMetadataSync => "await_metadata_sync",
            Self::MirrorToDisk => "mirror_to_disk",
            Self::RebindDurable => "rebind_durable",
            Self::RejoinNetwork => "rejoin_network",
            Self::Complete => "complete",
            Self::ReturnEarly => "return_early",
            Self::FailedCleanup => "failed_cleanup",
        };
        f.write_str(name)
    }
}

/// Transient state of one in-flight download. Never persisted.
pub struct DownloadAttemptState {
    pub id: Uuid,
    pub key: ArchiveKey,
    pub phase: DownloadPhase,
    /// Port of the active binding.
    pub port: Option<u16>,
    /// Peer-connection attempts used by the latest join.
    pub attempts: u32,
    pub volatile: ArchiveHandle,
    pub durable: Option<ArchiveHandle>,
    secret_dir: PathBuf,
    events: broadcast::Receiver<ArchiveEvent>,
}

impl DownloadAttemptState {
    fn new(key: ArchiveKey, volatile: ArchiveHandle, secret_dir: PathBuf) -> Self {
        let events = volatile.archive().subscribe();
        Self {
            id: Uuid::new_v4(),
            key,
            phase: DownloadPhase::StagingVolatile,
            port: None,
            attempts: 0,
            volatile,
            durable: None,
            secret_dir,
            events,
        }
    }

    fn enter(&mut self, phase: DownloadPhase) {
        tracing::debug!(
            download = %self.id,
            key = %self.key,
            from = %self.phase,
            phase = %phase,
            port = ?self.port,
            "download phase"
        );
        self.phase = phase;
    }
}

impl ArchiveManager {
    /// Download the archive `key` from peers into durable storage.
    ///
    /// Fails with `DownloadInProgress` while another download of `key` is
    /// active; returns the existing handle if `key` is already complete.
    pub async fn download(
        &self,
        key: ArchiveKey,
        options: DownloadOptions,
    ) -> ManagerResult<ArchiveHandle> {
        if let Some(existing) = self.inner.registry.get(&key) {
            return settle_existing(existing);
        }
        if marker_exists(&self.inner.config.archive_dir(&key)) {
            return settle_existing(self.get(key).await?);
        }

        let secret_dir = self.secret_dir(options.secret_dir.as_ref());
        let archive = self
            .inner
            .engine
            .open_archive(ArchiveOptions::volatile(key).with_secret_dir(&secret_dir))
            .await?;
        let volatile = ArchiveHandle::new(archive);
        if let Claim::Existing(existing) = self.inner.registry.claim(volatile.clone()) {
            volatile.close_quietly().await;
            return settle_existing(existing);
        }

        let mut state = DownloadAttemptState::new(key, volatile, secret_dir);
        tracing::info!(download = %state.id, key = %key, "download started");

        if let Err(e) = self.connect_volatile(&mut state, options.force_port).await {
            return Err(self.abandon(state, e).await);
        }

        if options.resolve_on_start {
            state.enter(DownloadPhase::ReturnEarly);
            let handle = state.volatile.clone();
            let manager = self.clone();
            tokio::spawn(async move {
                let id = state.id;
                if let Err(e) = manager.finish(state).await {
                    tracing::warn!(download = %id, key = %key, error = %e, "background download failed");
                }
            });
            return Ok(handle);
        }

        self.finish(state).await
    }

    async fn finish(&self, mut state: DownloadAttemptState) -> ManagerResult<ArchiveHandle> {
        match self.complete(&mut state).await {
            Ok(handle) => Ok(handle),
            Err(e) => Err(self.abandon(state, e).await),
        }
    }

    async fn connect_volatile(
        &self,
        state: &mut DownloadAttemptState,
        force_port: Option<u16>,
    ) -> ManagerResult<()> {
        state.enter(DownloadPhase::JoinNetwork);
        state.enter(DownloadPhase::AwaitPeerConnected);
        let connected = self
            .inner
            .connector
            .ensure_connected(state.volatile.archive().as_ref(), PortPool::Download, force_port)
            .await?;
        state.port = Some(connected.port());
        state.attempts = connected.attempts;
        state.volatile.attach_network(connected.network);
        Ok(())
    }

    /// Steps after the first peer connection.
    async fn complete(&self, state: &mut DownloadAttemptState) -> ManagerResult<ArchiveHandle> {
        let key = state.key;
        let volatile = state.volatile.archive().clone();

        if !volatile.writable() && !volatile.has_metadata() {
            state.enter(DownloadPhase::AwaitMetadataSync);
            self.await_metadata(state).await?;
        }
        volatile.download_metadata().await?;

        state.enter(DownloadPhase::MirrorToDisk);
        let dest = self.inner.config.archive_dir(&key);
        let summary = self.mirror_to_disk(state, dest.clone()).await?;
        tracing::info!(key = %key, files = summary.files, bytes = summary.bytes, "content mirrored");

        state.enter(DownloadPhase::RebindDurable);
        verify_mirror(&dest, &summary, volatile.stats().files)?;
        let durable = self
            .inner
            .engine
            .open_archive(ArchiveOptions::durable(key, &dest).with_secret_dir(&state.secret_dir))
            .await?;
        let durable = ArchiveHandle::new(durable);
        state.durable = Some(durable.clone());
        self.persist(&self.record_for(key, &dest, durable.writable(), &state.secret_dir))
            .await?;

        state.volatile.close_quietly().await;
        state.port = None;

        state.enter(DownloadPhase::RejoinNetwork);
        let connected = self
            .inner
            .connector
            .ensure_connected(durable.archive().as_ref(), PortPool::Download, None)
            .await?;
        state.port = Some(connected.port());
        state.attempts = connected.attempts;
        durable.attach_network(connected.network);

        durable.mark_complete();
        if !self
            .inner
            .registry
            .replace_instance(&state.volatile, durable.clone())
        {
            return Err(ManagerError::NotFound(format!(
                "{} was removed during download",
                key
            )));
        }
        state.enter(DownloadPhase::Complete);
        tracing::info!(download = %state.id, key = %key, port = ?state.port, "download complete");
        Ok(durable)
    }

    async fn await_metadata(&self, state: &mut DownloadAttemptState) -> ManagerResult<()> {
        let key = state.key;
        let archive = state.volatile.archive().clone();
        let wait = async {
            loop {
                if archive.has_metadata() {
                    return Ok(());
                }
                match state.events.recv().await {
                    Ok(ArchiveEvent::MetadataSynced { version }) => {
                        tracing::debug!(key = %key, version, "metadata synced");
                        return Ok(());
                    }
                    Ok(ArchiveEvent::Update(_)) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        return Err(ManagerError::Engine(crate::engine::EngineError::Closed))
                    }
                }
            }
        };
        tokio::time::timeout(self.inner.config.download.metadata_timeout, wait)
            .await
            .map_err(|_| ManagerError::MetadataSyncTimeout { key })?
    }

    /// Copy the volatile tree to `dest`, failing if no progress is seen for
    /// the idle window.
    async fn mirror_to_disk(
        &self,
        state: &mut DownloadAttemptState,
        dest: PathBuf,
    ) -> ManagerResult<MirrorSummary> {
        let key = state.key;
        let idle = self.inner.config.download.idle_timeout;
        let mut mirror = mirror(state.volatile.archive().clone(), dest);

        let stall = tokio::time::sleep(idle);
        tokio::pin!(stall);
        let mut puts_open = true;
        let mut events_open = true;

        loop {
            tokio::select! {
                result = &mut mirror.done => {
                    return match result {
                        Ok(Ok(summary)) => Ok(summary),
                        Ok(Err(e)) => Err(ManagerError::MirrorFailure(e.to_string())),
                        Err(_) => Err(ManagerError::MirrorFailure(
                            "mirror ended without a result".to_string(),
                        )),
                    };
                }
                put = mirror.puts.next(), if puts_open => match put {
                    Some(put) => {
                        tracing::trace!(key = %key, file = %put.path, bytes = put.bytes, "mirrored file");
                        stall.as_mut().reset(Instant::now() + idle);
                    }
                    None => puts_open = false,
                },
                event = state.events.recv(), if events_open => match event {
                    Ok(ArchiveEvent::Update(stats)) => {
                        state.volatile.record_progress(stats.progress());
                        stall.as_mut().reset(Instant::now() + idle);
                    }
                    Ok(ArchiveEvent::MetadataSynced { .. }) => {}
                    Err(RecvError::Lagged(_)) => {
                        state.volatile.record_progress(state.volatile.stats().progress());
                        stall.as_mut().reset(Instant::now() + idle);
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
                _ = &mut stall => {
                    tracing::warn!(key = %key, idle = ?idle, "download stalled");
                    return Err(ManagerError::DownloadStalled { key, idle });
                }
            }
        }
    }

    /// Tolerant removal of everything the download created.
    async fn abandon(&self, mut state: DownloadAttemptState, error: ManagerError) -> ManagerError {
        let from = state.phase;
        state.enter(DownloadPhase::FailedCleanup);
        tracing::warn!(
            download = %state.id,
            key = %state.key,
            phase = %from,
            error = %error,
            "download failed"
        );
        let mut handles = vec![&state.volatile];
        if let Some(durable) = &state.durable {
            handles.push(durable);
        }
        self.purge(state.key, &handles).await;
        error
    }
}

/// A finished mirror must have written the marker and every remote file.
/// Opening a durable archive creates the marker itself, so this runs first.
fn verify_mirror(dest: &Path, summary: &MirrorSummary, expected_files: u64) -> ManagerResult<()> {
    if !marker_exists(dest) {
        return Err(ManagerError::MirrorFailure(format!(
            "archive marker missing in {}",
            dest.display()
        )));
    }
    if summary.files != expected_files {
        return Err(ManagerError::MirrorFailure(format!(
            "mirrored {} of {} files into {}",
            summary.files,
            expected_files,
            dest.display()
        )));
    }
    Ok(())
}

/// Conflict rule for a key that already has a live handle.
fn settle_existing(existing: ArchiveHandle) -> ManagerResult<ArchiveHandle> {
    if existing.is_complete() {
        Ok(existing)
    } else {
        Err(ManagerError::DownloadInProgress(existing.key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::engine::mock::{MockEngine, PeerBehavior};
    use crate::persistence::{MemoryRecordStore, RecordStore};
    use crate::ports::PortRange;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn key(byte: u8) -> ArchiveKey {
        ArchiveKey::from_bytes(&[byte; 32]).unwrap()
    }

    fn manager(dir: &TempDir) -> (ArchiveManager, MockEngine, Arc<MemoryRecordStore>) {
        let mut config = ManagerConfig::new(dir.path().to_path_buf());
        config.network.upload_ports = PortRange::new(8000, 8010);
        config.network.download_ports = PortRange::new(8100, 8110);
        config.network.peer_timeout = Duration::from_millis(150);
        config.network.poll_interval = Duration::from_millis(20);
        config.download.metadata_timeout = Duration::from_millis(200);
        config.download.idle_timeout = Duration::from_millis(200);
        config.removal.grace = Duration::from_millis(5);

        let engine = MockEngine::new();
        let store = Arc::new(MemoryRecordStore::new());
        let manager = ArchiveManager::new(config, Arc::new(engine.clone()), store.clone()).unwrap();
        (manager, engine, store)
    }

    #[tokio::test]
    async fn test_download_mirrors_and_persists() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, store) = manager(&dir);
        engine
            .swarm()
            .seed(key(1), [("a.txt", b"alpha".to_vec()), ("d/b.txt", b"beta".to_vec())]);

        let handle = manager.download(key(1), DownloadOptions::default()).await.unwrap();
        assert!(handle.storage().is_durable());
        assert!(!handle.writable());
        assert_eq!(manager.progress(&key(1)), Some(1.0));
        assert!(handle.is_connected());

        let dest = manager.config().archive_dir(&key(1));
        assert!(marker_exists(&dest));
        assert_eq!(std::fs::read(dest.join("d/b.txt")).unwrap(), b"beta");
        let record = store.find_one(&key(1)).await.unwrap().unwrap();
        assert_eq!(record.path, dest);
        assert!(!record.writable);

        // The volatile lease is gone; only the durable binding holds a port.
        assert_eq!(manager.ports().in_use(PortPool::Download).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_times_out_and_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, store) = manager(&dir);

        let result = manager.download(key(2), DownloadOptions::default()).await;
        assert!(matches!(
            result,
            Err(ManagerError::PeerConnectionTimeout { attempts: 3 })
        ));
        assert_eq!(engine.swarm().join_ports(&key(2)), vec![8100, 8101, 8102]);
        assert!(!manager.exists(key(2)).await.unwrap());
        assert!(store.find_one(&key(2)).await.unwrap().is_none());
        assert!(manager.ports().in_use(PortPool::Download).is_empty());
    }

    #[tokio::test]
    async fn test_force_port_sets_first_bind() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, _store) = manager(&dir);
        engine.swarm().seed(key(3), [("f", b"f".to_vec())]);

        manager
            .download(
                key(3),
                DownloadOptions {
                    force_port: Some(8105),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(engine.swarm().join_ports(&key(3))[0], 8105);
    }

    #[tokio::test]
    async fn test_offline_peer_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, _store) = manager(&dir);
        engine.swarm().set_behavior(key(4), PeerBehavior::Offline);

        let result = manager.download(key(4), DownloadOptions::default()).await;
        assert!(matches!(result, Err(ManagerError::PeerUnreachable { .. })));
        assert!(!manager.exists(key(4)).await.unwrap());
    }

    #[tokio::test]
    async fn test_withheld_metadata_times_out() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, _store) = manager(&dir);
        engine.swarm().seed(key(5), [("f", b"f".to_vec())]);
        engine.swarm().withhold_metadata(key(5));

        let result = manager.download(key(5), DownloadOptions::default()).await;
        assert!(matches!(result, Err(ManagerError::MetadataSyncTimeout { .. })));
        assert!(!manager.exists(key(5)).await.unwrap());
        assert!(manager.ports().in_use(PortPool::Download).is_empty());
    }

    #[tokio::test]
    async fn test_stalled_reads_fail_download() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, _store) = manager(&dir);
        engine.swarm().seed(key(6), [("f", b"f".to_vec())]);
        engine.swarm().stall_reads(key(6));

        let result = manager.download(key(6), DownloadOptions::default()).await;
        assert!(matches!(result, Err(ManagerError::DownloadStalled { .. })));
        assert!(!manager.config().archive_dir(&key(6)).exists());
    }

    #[tokio::test]
    async fn test_partial_mirror_fails_and_purges() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, store) = manager(&dir);
        engine
            .swarm()
            .seed(key(9), [("a.txt", b"a".to_vec()), ("b.txt", b"b".to_vec())]);
        engine.swarm().hide_file(key(9), "b.txt");

        let result = manager.download(key(9), DownloadOptions::default()).await;
        assert!(matches!(result, Err(ManagerError::MirrorFailure(_))));
        assert!(!manager.config().archive_dir(&key(9)).exists());
        assert!(store.find_one(&key(9)).await.unwrap().is_none());
        assert!(!manager.exists(key(9)).await.unwrap());
        assert!(manager.ports().in_use(PortPool::Download).is_empty());
    }

    #[tokio::test]
    async fn test_verify_mirror_needs_marker_and_every_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("a.txt"), b"a").unwrap();
        let summary = MirrorSummary { files: 1, bytes: 1 };

        assert!(matches!(
            verify_mirror(&dest, &summary, 1),
            Err(ManagerError::MirrorFailure(_))
        ));

        crate::engine::content::write_marker(&dest, &key(10), 1)
            .await
            .unwrap();
        verify_mirror(&dest, &summary, 1).unwrap();
        assert!(matches!(
            verify_mirror(&dest, &summary, 2),
            Err(ManagerError::MirrorFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_second_download_is_in_progress() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, _store) = manager(&dir);
        engine.swarm().seed(key(7), [("f", b"f".to_vec())]);
        engine.swarm().set_connect_delay(Duration::from_millis(100));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.download(key(7), DownloadOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = manager.download(key(7), DownloadOptions::default()).await;
        assert!(matches!(second, Err(ManagerError::DownloadInProgress(_))));
        first.await.unwrap().unwrap();

        let again = manager.download(key(7), DownloadOptions::default()).await.unwrap();
        assert!(again.storage().is_durable());
    }

    #[tokio::test]
    async fn test_resolve_on_start_finishes_in_background() {
        let dir = TempDir::new().unwrap();
        let (manager, engine, store) = manager(&dir);
        engine.swarm().seed(key(8), [("f", vec![7u8; 1024])]);
        engine.swarm().set_metadata_delay(Duration::from_millis(50));

        let handle = manager
            .download(
                key(8),
                DownloadOptions {
                    resolve_on_start: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!handle.storage().is_durable());
        assert!(handle.progress() < 1.0);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !manager
                .handle(&key(8))
                .is_some_and(|h| h.storage().is_durable())
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.progress(&key(8)), Some(1.0));
        assert!(store.find_one(&key(8)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_phase_names() {
        assert_eq!(DownloadPhase::AwaitMetadataSync.to_string(), "await_metadata_sync");
        assert_eq!(DownloadPhase::FailedCleanup.to_string(), "failed_cleanup");
    }
}
