//! Trait abstractions for the archive engine.
//!
//! The replication engine is an external collaborator. The manager only talks
//! to it through [`ArchiveEngine`] and [`Archive`], which lets the simulated
//! engine in [`super::mock`] stand in for a real swarm during tests.

use super::network::NetworkBinding;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Length of an archive key in bytes (an Ed25519 public key).
pub const KEY_LEN: usize = 32;

/// Content block size used for progress accounting.
pub const BLOCK_SIZE: u64 = 64 * 1024;

/// Number of content blocks needed to hold `len` bytes.
pub fn blocks_for(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE)
}

/// Errors produced while parsing archive keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid hex in archive key: {0}")]
    InvalidHex(String),

    #[error("archive key must be {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// Public-key-derived archive identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey([u8; KEY_LEN]);

impl ArchiveKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self(key))
    }

    /// Parse a hex-encoded key.
    pub fn from_hex(value: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(value.trim()).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Get bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Key under which peers announce themselves.
    ///
    /// Hashing keeps the public key itself out of the announce directory, so
    /// only parties that already know the key can locate its swarm.
    pub fn discovery_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"swarmvault-discovery");
        hasher.update(self.0);
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveKey({})", self)
    }
}

impl FromStr for ArchiveKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ArchiveKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ArchiveKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// Where an archive keeps its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// A directory on disk that survives restarts.
    Durable(PathBuf),
    /// Process memory; gone once the archive is closed.
    Volatile,
}

impl StorageLocation {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Durable(path) => Some(path),
            Self::Volatile => None,
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Durable(_))
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Durable(path) => write!(f, "{}", path.display()),
            Self::Volatile => write!(f, "<volatile>"),
        }
    }
}

/// Options for instantiating an archive.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub key: ArchiveKey,
    pub storage: StorageLocation,
    /// Fetch blocks on demand instead of replicating eagerly.
    pub sparse: bool,
    /// Directory holding private keys; the archive is writable when it holds
    /// the secret matching `key`.
    pub secret_dir: Option<PathBuf>,
}

impl ArchiveOptions {
    pub fn durable(key: ArchiveKey, path: impl Into<PathBuf>) -> Self {
        Self {
            key,
            storage: StorageLocation::Durable(path.into()),
            sparse: false,
            secret_dir: None,
        }
    }

    pub fn volatile(key: ArchiveKey) -> Self {
        Self {
            key,
            storage: StorageLocation::Volatile,
            sparse: true,
            secret_dir: None,
        }
    }

    pub fn with_secret_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.secret_dir = Some(dir.into());
        self
    }
}

/// Content statistics as reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub files: u64,
    pub byte_length: u64,
    /// Total content blocks.
    pub length: u64,
    /// Content blocks held locally.
    pub downloaded: u64,
    pub version: u64,
}

impl ArchiveStats {
    /// Fraction of content blocks held locally.
    pub fn progress(&self) -> f64 {
        if self.length == 0 {
            return 0.0;
        }
        (self.downloaded as f64 / self.length as f64).min(1.0)
    }
}

/// Notifications emitted by an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEvent {
    /// Remote metadata has been received.
    MetadataSynced { version: u64 },
    /// Content statistics changed (blocks downloaded, files written).
    Update(ArchiveStats),
}

/// Outcome of an import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Archive paths written, in import order.
    pub files: Vec<String>,
    pub bytes: u64,
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine operation errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("archive not found: {0}")]
    NotFound(String),

    #[error("archive {0} is not writable")]
    NotWritable(ArchiveKey),

    #[error("file not found in archive: {0}")]
    FileNotFound(String),

    #[error("invalid archive path: {0}")]
    InvalidPath(String),

    #[error("archive root holds key {found}, expected {expected}")]
    KeyMismatch { expected: ArchiveKey, found: String },

    #[error("archive is closed")]
    Closed,

    #[error("no peers available")]
    NoPeers,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single archive instance held by the engine.
#[async_trait]
pub trait Archive: Send + Sync {
    fn key(&self) -> ArchiveKey;

    /// True iff the matching private key is held locally.
    fn writable(&self) -> bool;

    fn storage(&self) -> StorageLocation;

    /// True once metadata (the file tree) is available locally.
    fn has_metadata(&self) -> bool;

    /// Subscribe to metadata-sync and stats notifications.
    fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent>;

    fn stats(&self) -> ArchiveStats;

    /// Fetch the complete metadata range eagerly.
    async fn download_metadata(&self) -> EngineResult<()>;

    async fn write_file(&self, path: &str, data: &[u8]) -> EngineResult<()>;

    async fn read_file(&self, path: &str) -> EngineResult<Vec<u8>>;

    /// Paths of every file in the archive's tree.
    async fn list_files(&self) -> EngineResult<Vec<String>>;

    /// Bind the archive's transport on `port`.
    ///
    /// Returns as soon as the bind has been started; listening, connection and
    /// error notifications arrive on the binding's event stream.
    async fn join_network(&self, port: u16) -> EngineResult<NetworkBinding>;

    async fn close(&self) -> EngineResult<()>;

    /// Copy a file from disk into the archive at `dest`.
    async fn write_file_from_disk(&self, src: &Path, dest: &str) -> EngineResult<()> {
        let data = tokio::fs::read(src).await?;
        self.write_file(dest, &data).await
    }

    /// Import a file or directory from disk.
    ///
    /// A file lands at `/<file name>`; a directory's contents land at the root.
    async fn import_files(&self, src: &Path) -> EngineResult<ImportSummary> {
        if !self.writable() {
            return Err(EngineError::NotWritable(self.key()));
        }
        let entries = super::content::import_entries(src).await?;
        let mut summary = ImportSummary::default();
        for (source, dest) in entries {
            let len = tokio::fs::metadata(&source).await?.len();
            self.write_file_from_disk(&source, &dest).await?;
            tracing::debug!(key = %self.key(), file = %dest, "imported file");
            summary.bytes += len;
            summary.files.push(dest);
        }
        Ok(summary)
    }
}

/// Factory for archive instances.
#[async_trait]
pub trait ArchiveEngine: Send + Sync {
    /// Generate a fresh keypair, store its secret under `secret_dir`, and
    /// return the derived archive key.
    async fn generate_key(&self, secret_dir: &Path) -> EngineResult<ArchiveKey>;

    /// Instantiate an archive (creating durable storage if needed).
    async fn open_archive(&self, options: ArchiveOptions) -> EngineResult<Arc<dyn Archive>>;
}
