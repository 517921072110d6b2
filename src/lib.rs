//! Swarmvault - lifecycle manager for replicated archives
//!
//! Archives are content-addressed by an Ed25519 public key and replicated by
//! an archive engine. This crate is the orchestration layer on top of the
//! engine:
//! - [`ports`]: upload and download port pools with self-releasing leases
//! - [`network`]: joining the network and waiting for peers, with rebinding
//! - [`manager`]: create, download, import, resume and remove archives
//! - [`registry`] and [`persistence`]: live handles and the on-disk index
//!
//! The engine is reached only through the traits in [`engine`]; a simulated
//! engine backs the tests and a small TCP engine backs the binary.

pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod manager;
pub mod network;
pub mod persistence;
pub mod ports;
pub mod registry;
pub mod retry;

pub use config::ManagerConfig;
pub use error::{ManagerError, ManagerResult};
pub use handle::{ArchiveHandle, ArchiveStatus};
pub use manager::{ArchiveManager, CreateOptions, DownloadOptions, ResumeReport};
