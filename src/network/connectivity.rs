//! Peer-connectivity retry loop.
//!
//! Wraps a peer-connect join with a deadline. While the join is pending the
//! binding's status is polled: a transport that is listening but neither
//! connected nor connecting has given up, which fails immediately. When the
//! deadline passes the binding is dropped (freeing its port) and the join is
//! retried from the next port, up to `max_attempts` times.

use super::join::{JoinCoordinator, JoinMode, JoinedNetwork};
use crate::engine::{Archive, NetworkStatus};
use crate::error::{ManagerError, ManagerResult};
use crate::ports::PortPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Deadlines of the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivitySettings {
    /// How long each attempt waits for a peer.
    pub peer_timeout: Duration,
    /// How often the transport status is checked.
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

/// A peer-connected binding and the attempt that produced it.
pub struct Connected {
    pub network: JoinedNetwork,
    pub attempts: u32,
}

impl Connected {
    /// Port the archive finally bound.
    pub fn port(&self) -> u16 {
        self.network.port()
    }
}

enum Attempt {
    Connected(JoinedNetwork),
    Failed(ManagerError),
    Unreachable,
    TimedOut { port: Option<u16> },
}

/// Joins archives in peer-connect mode, rebinding until a peer connects.
#[derive(Clone)]
pub struct PeerConnector {
    coordinator: JoinCoordinator,
    settings: ConnectivitySettings,
}

impl PeerConnector {
    pub fn new(coordinator: JoinCoordinator, settings: ConnectivitySettings) -> Self {
        Self {
            coordinator,
            settings,
        }
    }

    pub fn settings(&self) -> &ConnectivitySettings {
        &self.settings
    }

    /// Join `archive` on `pool` (starting at `hint`) and wait for a peer.
    ///
    /// Total time is bounded by `max_attempts × peer_timeout`.
    pub async fn ensure_connected(
        &self,
        archive: &dyn Archive,
        pool: PortPool,
        hint: Option<u16>,
    ) -> ManagerResult<Connected> {
        let key = archive.key();
        let max_attempts = self.settings.max_attempts;
        let mut hint = hint;

        for attempt in 1..=max_attempts {
            match self.attempt(archive, pool, hint).await {
                Attempt::Connected(network) => {
                    tracing::info!(key = %key, port = network.port(), attempt, "peer connected");
                    return Ok(Connected {
                        network,
                        attempts: attempt,
                    });
                }
                Attempt::Failed(e) => return Err(e),
                Attempt::Unreachable => {
                    tracing::warn!(key = %key, attempt, "transport is neither connected nor connecting");
                    return Err(ManagerError::PeerUnreachable { key });
                }
                Attempt::TimedOut { port } => {
                    if attempt == max_attempts {
                        tracing::warn!(key = %key, attempt, "peer connection timeout");
                        break;
                    }
                    tracing::info!(key = %key, ?port, attempt, "no peer connected, rebinding");
                    if let Some(port) = port {
                        hint = Some(port.wrapping_add(1));
                    }
                }
            }
        }

        Err(ManagerError::PeerConnectionTimeout {
            attempts: max_attempts,
        })
    }

    /// One bounded wait. The pending join (and its binding and lease) is
    /// dropped when this returns without a connection.
    async fn attempt(&self, archive: &dyn Archive, pool: PortPool, hint: Option<u16>) -> Attempt {
        let (observer, status) = watch::channel::<Option<NetworkStatus>>(None);
        let join = self.coordinator.join_observed(
            archive,
            JoinMode::ResolveOnPeerConnect,
            pool,
            hint,
            Some(&observer),
        );
        tokio::pin!(join);

        let deadline = tokio::time::sleep(self.settings.peer_timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut join => {
                    return match result {
                        Ok(network) => Attempt::Connected(network),
                        Err(e) => Attempt::Failed(e),
                    };
                }
                _ = &mut deadline => {
                    let port = status.borrow().as_ref().map(NetworkStatus::port);
                    return Attempt::TimedOut { port };
                }
                _ = poll.tick() => {
                    let current = status.borrow().clone();
                    if let Some(current) = current {
                        if current.is_listening() && !current.is_connected() && !current.is_connecting() {
                            return Attempt::Unreachable;
                        }
                    }
                }
            }
        }
    }
}
