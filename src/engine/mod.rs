//! Archive engine boundary.
//!
//! This module provides:
//! - Trait abstractions for archive engines ([`ArchiveEngine`], [`Archive`])
//! - Network bindings with listening/connection/error event streams
//! - Directory-backed archive content with an `.archive` marker
//! - Directory mirroring with `put` events and a completion channel
//! - A simulated engine for tests and a local TCP engine for the binary

pub mod base;
pub mod content;
pub mod keys;
pub mod local;
pub mod mirror;
pub mod mock;
pub mod network;
pub mod traits;
pub mod wire;

pub use content::{marker_exists, ARCHIVE_MARKER};
pub use local::LocalEngine;
pub use mirror::{mirror, Mirror, MirrorPut, MirrorSummary};
pub use network::{NetworkBinding, NetworkEvent, NetworkFault, NetworkStatus};
pub use traits::{
    Archive, ArchiveEngine, ArchiveEvent, ArchiveKey, ArchiveOptions, ArchiveStats, EngineError,
    EngineResult, ImportSummary, KeyError, StorageLocation,
};
