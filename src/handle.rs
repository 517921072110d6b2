//! Live archive handles.
//!
//! An [`ArchiveHandle`] is one archive instance owned by the registry. It owns
//! the instance's network binding and port lease once joined, so closing the
//! handle leaves the network and frees the port.

use crate::engine::{Archive, ArchiveKey, ArchiveStats, EngineResult, StorageLocation};
use crate::network::JoinedNetwork;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Shared handle to a live archive instance.
#[derive(Clone)]
pub struct ArchiveHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    archive: Arc<dyn Archive>,
    network: Mutex<Option<JoinedNetwork>>,
    /// `f64` bits; only ever raised.
    progress: AtomicU64,
    closed: AtomicBool,
}

impl ArchiveHandle {
    /// Wrap an instance. Writable and durable instances start complete.
    pub fn new(archive: Arc<dyn Archive>) -> Self {
        let progress = if archive.writable() || archive.storage().is_durable() {
            1.0
        } else {
            archive.stats().progress()
        };
        Self {
            inner: Arc::new(HandleInner {
                archive,
                network: Mutex::new(None),
                progress: AtomicU64::new(progress.to_bits()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn key(&self) -> ArchiveKey {
        self.inner.archive.key()
    }

    pub fn writable(&self) -> bool {
        self.inner.archive.writable()
    }

    pub fn storage(&self) -> StorageLocation {
        self.inner.archive.storage()
    }

    pub fn archive(&self) -> &Arc<dyn Archive> {
        &self.inner.archive
    }

    /// True if both handles refer to the same instance.
    pub fn same_instance(&self, other: &ArchiveHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take ownership of a binding, replacing (and leaving) any previous one.
    pub fn attach_network(&self, network: JoinedNetwork) {
        let previous = self
            .inner
            .network
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(network);
        drop(previous);
    }

    /// Give up the binding without closing the archive.
    pub fn detach_network(&self) -> Option<JoinedNetwork> {
        self.inner
            .network
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn with_network<T>(&self, f: impl FnOnce(&JoinedNetwork) -> T) -> Option<T> {
        self.inner
            .network
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(f)
    }

    /// Port of the current binding.
    pub fn port(&self) -> Option<u16> {
        self.with_network(JoinedNetwork::port)
    }

    pub fn is_joined(&self) -> bool {
        self.port().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.with_network(|n| n.status().is_connected())
            .unwrap_or(false)
    }

    pub fn peer_count(&self) -> usize {
        self.with_network(|n| n.status().peer_count()).unwrap_or(0)
    }

    /// Fraction of content downloaded, `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.inner.progress.load(Ordering::SeqCst))
    }

    /// Raise progress to `value`. Lower values are ignored.
    pub fn record_progress(&self, value: f64) {
        let value = value.clamp(0.0, 1.0);
        let _ = self
            .inner
            .progress
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                (value > f64::from_bits(bits)).then(|| value.to_bits())
            });
    }

    pub fn mark_complete(&self) {
        self.record_progress(1.0);
    }

    pub fn is_complete(&self) -> bool {
        self.progress() >= 1.0
    }

    pub fn stats(&self) -> ArchiveStats {
        self.inner.archive.stats()
    }

    pub fn status(&self) -> ArchiveStatus {
        ArchiveStatus {
            key: self.key(),
            writable: self.writable(),
            storage: self.storage(),
            connected: self.is_connected(),
            port: self.port(),
            peers: self.peer_count(),
            progress: self.progress(),
            stats: self.stats(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Leave the network, free the port, and close the instance.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&self) -> EngineResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        drop(self.detach_network());
        self.inner.archive.close().await
    }

    /// Close, logging instead of failing.
    pub async fn close_quietly(&self) {
        if let Err(e) = self.close().await {
            tracing::warn!(key = %self.key(), error = %e, "failed to close archive");
        }
    }
}

impl fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("key", &self.key())
            .field("storage", &self.storage())
            .field("port", &self.port())
            .field("progress", &self.progress())
            .finish()
    }
}

/// Snapshot of a handle and its content statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveStatus {
    pub key: ArchiveKey,
    pub writable: bool,
    pub storage: StorageLocation,
    pub connected: bool,
    pub port: Option<u16>,
    pub peers: usize,
    pub progress: f64,
    pub stats: ArchiveStats,
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Key:        {}", self.key)?;
        writeln!(f, "Writable:   {}", self.writable)?;
        writeln!(f, "Storage:    {}", self.storage)?;
        match self.port {
            Some(port) => writeln!(
                f,
                "Network:    port {} ({} peer(s), connected: {})",
                port, self.peers, self.connected
            )?,
            None => writeln!(f, "Network:    offline")?,
        }
        writeln!(f, "Progress:   {:.1}%", self.progress * 100.0)?;
        writeln!(f, "Files:      {}", self.stats.files)?;
        writeln!(f, "Bytes:      {}", self.stats.byte_length)?;
        writeln!(
            f,
            "Blocks:     {}/{}",
            self.stats.downloaded, self.stats.length
        )?;
        write!(f, "Version:    {}", self.stats.version)
    }
}
