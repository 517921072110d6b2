//! Error types for the archive manager.

use crate::config::ConfigError;
use crate::engine::{ArchiveKey, EngineError, KeyError, NetworkFault};
use crate::persistence::StoreError;
use crate::ports::{PortExhausted, PortPool};
use std::time::Duration;
use thiserror::Error;

/// Result type for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Manager operation errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no free port in {pool} pool")]
    PortExhausted { pool: PortPool },

    #[error("port {port} already in use")]
    BindConflict { port: u16 },

    #[error("peer connection timeout after {attempts} attempt(s)")]
    PeerConnectionTimeout { attempts: u32 },

    #[error("unable to establish network connection for {key}")]
    PeerUnreachable { key: ArchiveKey },

    #[error("timed out waiting for metadata of {key}")]
    MetadataSyncTimeout { key: ArchiveKey },

    #[error("mirror failed: {0}")]
    MirrorFailure(String),

    #[error("download of {key} stalled: no progress for {}", human(.idle))]
    DownloadStalled { key: ArchiveKey, idle: Duration },

    #[error("download of {0} already in progress")]
    DownloadInProgress(ArchiveKey),

    #[error("archive {0} is not writable")]
    NotWritable(ArchiveKey),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("archive not found: {0}")]
    NotFound(String),

    #[error("invalid archive key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("network error: {0}")]
    Network(#[from] NetworkFault),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn human(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

impl From<PortExhausted> for ManagerError {
    fn from(err: PortExhausted) -> Self {
        Self::PortExhausted { pool: err.pool }
    }
}

impl ManagerError {
    /// True for errors caused by the request itself rather than the swarm.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::DownloadInProgress(_)
                | Self::NotWritable(_)
                | Self::InvalidPath(_)
                | Self::NotFound(_)
                | Self::InvalidKey(_)
        )
    }
}
