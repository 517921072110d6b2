//! Network orchestration for archive instances.
//!
//! - [`join`]: binds an archive on a leased port, first qualifying event wins
//! - [`connectivity`]: bounded retry loop that rebinds until a peer connects
//! - [`settle`]: the single-resolution guard shared by event handlers

pub mod connectivity;
pub mod join;
pub mod settle;

pub use connectivity::{Connected, ConnectivitySettings, PeerConnector};
pub use join::{JoinCoordinator, JoinMode, JoinedNetwork};
pub use settle::SettleOnce;
