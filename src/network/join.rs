//! Network join coordinator.
//!
//! Binds one archive to the network on a leased port. The binding's listening,
//! connection, and error events are dispatched to handlers that share a
//! [`SettleOnce`] guard, so only the first qualifying event resolves the join.
//! A bind conflict moves on to the next port of the same pool; any other
//! transport error closes the archive.

use super::settle::SettleOnce;
use crate::engine::network::NetworkEvents;
use crate::engine::{Archive, NetworkBinding, NetworkEvent, NetworkFault, NetworkStatus};
use crate::error::{ManagerError, ManagerResult};
use crate::ports::{PortAllocator, PortExhausted, PortLease, PortPool};
use futures::StreamExt;
use std::net::SocketAddr;
use tokio::sync::watch;

/// Which event resolves a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Resolve once the socket is listening (sharing a populated archive).
    ResolveOnListening,
    /// Resolve once a peer connects (downloads).
    ResolveOnPeerConnect,
}

/// Publishes the status of the binding currently being joined.
pub type StatusObserver = watch::Sender<Option<NetworkStatus>>;

/// A live binding and the lease of its port.
///
/// Dropping it leaves the network and frees the port.
pub struct JoinedNetwork {
    pub binding: NetworkBinding,
    pub lease: PortLease,
}

impl JoinedNetwork {
    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    pub fn status(&self) -> NetworkStatus {
        self.binding.status()
    }

    pub fn into_parts(self) -> (NetworkBinding, PortLease) {
        (self.binding, self.lease)
    }
}

#[derive(Debug)]
enum Resolution {
    Listening,
    Connected(SocketAddr),
    Conflict,
    Failed(NetworkFault),
}

/// Binds archives to the network on ports from a [`PortAllocator`].
#[derive(Clone)]
pub struct JoinCoordinator {
    ports: PortAllocator,
}

impl JoinCoordinator {
    pub fn new(ports: PortAllocator) -> Self {
        Self { ports }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub async fn join(
        &self,
        archive: &dyn Archive,
        mode: JoinMode,
        pool: PortPool,
        hint: Option<u16>,
    ) -> ManagerResult<JoinedNetwork> {
        self.join_observed(archive, mode, pool, hint, None).await
    }

    /// Join, publishing each attempted binding's status to `observer`.
    ///
    /// Tries at most one bind per port of the pool before failing with
    /// `PortExhausted`. The caller owns cleanup of the archive on that error.
    pub async fn join_observed(
        &self,
        archive: &dyn Archive,
        mode: JoinMode,
        pool: PortPool,
        hint: Option<u16>,
        observer: Option<&StatusObserver>,
    ) -> ManagerResult<JoinedNetwork> {
        let key = archive.key();
        let mut hint = hint;

        for _ in 0..self.ports.capacity(pool) {
            let lease = match hint {
                Some(port) => self.ports.acquire_from(pool, port)?,
                None => self.ports.acquire(pool)?,
            };
            let port = lease.port();

            let mut binding = match archive.join_network(port).await {
                Ok(binding) => binding,
                Err(e) => {
                    drop(lease);
                    close_quietly(archive).await;
                    return Err(e.into());
                }
            };
            if let Some(observer) = observer {
                observer.send_replace(Some(binding.status()));
            }
            let Some(events) = binding.take_events() else {
                return Err(NetworkFault::Other("binding events already taken".to_string()).into());
            };

            match resolve(events, mode).await {
                Resolution::Listening => {
                    tracing::debug!(key = %key, port, %pool, "listening");
                    return Ok(JoinedNetwork { binding, lease });
                }
                Resolution::Connected(peer) => {
                    tracing::debug!(key = %key, port, %pool, peer = %peer, "peer connected");
                    return Ok(JoinedNetwork { binding, lease });
                }
                Resolution::Conflict => {
                    tracing::debug!(key = %key, port, %pool, "address in use, trying next port");
                    if let Some(observer) = observer {
                        observer.send_replace(None);
                    }
                    drop(binding);
                    drop(lease);
                    hint = Some(port.wrapping_add(1));
                }
                Resolution::Failed(fault) => {
                    tracing::warn!(key = %key, port, %pool, error = %fault, "network error");
                    drop(binding);
                    drop(lease);
                    close_quietly(archive).await;
                    return Err(ManagerError::Network(fault));
                }
            }
        }

        Err(PortExhausted { pool }.into())
    }
}

async fn close_quietly(archive: &dyn Archive) {
    if let Err(e) = archive.close().await {
        tracing::warn!(key = %archive.key(), error = %e, "close failed");
    }
}

/// Dispatch events to the handlers until one settles the join.
async fn resolve(mut events: NetworkEvents, mode: JoinMode) -> Resolution {
    let (guard, resolved) = SettleOnce::new();
    while let Some(event) = events.next().await {
        match event {
            NetworkEvent::Listening { .. } => on_listening(mode, &guard),
            NetworkEvent::Connection { peer } => on_connection(peer, &guard),
            NetworkEvent::Error(fault) => on_error(fault, &guard),
        }
        if guard.is_settled() {
            break;
        }
    }
    drop(guard);
    resolved.await.unwrap_or_else(|_| {
        Resolution::Failed(NetworkFault::Other(
            "transport closed before the join resolved".to_string(),
        ))
    })
}

fn on_listening(mode: JoinMode, guard: &SettleOnce<Resolution>) {
    if mode == JoinMode::ResolveOnListening {
        guard.settle(Resolution::Listening);
    }
}

fn on_connection(peer: SocketAddr, guard: &SettleOnce<Resolution>) {
    guard.settle(Resolution::Connected(peer));
}

fn on_error(fault: NetworkFault, guard: &SettleOnce<Resolution>) {
    match fault {
        NetworkFault::AddressInUse(_) => guard.settle(Resolution::Conflict),
        other => guard.settle(Resolution::Failed(other)),
    };
}
