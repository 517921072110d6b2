//! Network bindings handed out by the engine.
//!
//! A [`NetworkBinding`] is the manager's side of one archive's presence on the
//! network: an event stream (listening, connection, error) plus live
//! `connected`/`connecting` flags. The engine keeps the paired
//! [`NetworkDriver`] to publish events and to learn when the binding is
//! dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Low-level transport notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// The socket is bound and accepting peers.
    Listening { port: u16 },
    /// A peer connected.
    Connection { peer: SocketAddr },
    Error(NetworkFault),
}

/// Transport failures reported on the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkFault {
    #[error("address in use: port {0}")]
    AddressInUse(u16),

    #[error("{0}")]
    Other(String),
}

impl NetworkFault {
    pub fn from_io(port: u16, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::AddrInUse {
            Self::AddressInUse(port)
        } else {
            Self::Other(format!("port {}: {}", port, err))
        }
    }
}

/// Shared connectivity flags of a binding.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    inner: Arc<StatusInner>,
}

#[derive(Debug)]
struct StatusInner {
    port: u16,
    listening: AtomicBool,
    connected: AtomicBool,
    connecting: AtomicBool,
    peers: AtomicUsize,
}

impl NetworkStatus {
    fn new(port: u16) -> Self {
        Self {
            inner: Arc::new(StatusInner {
                port,
                listening: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                peers: AtomicUsize::new(0),
            }),
        }
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// True once the socket is bound.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// True while the transport is still looking for peers.
    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.load(Ordering::SeqCst)
    }
}

/// Event stream of a binding.
pub type NetworkEvents = UnboundedReceiverStream<NetworkEvent>;

/// One archive's presence on the network.
///
/// Dropping the binding leaves the network.
pub struct NetworkBinding {
    status: NetworkStatus,
    events: Option<NetworkEvents>,
    shutdown: watch::Sender<bool>,
}

impl NetworkBinding {
    /// Create a binding for `port` and the driver the engine keeps.
    pub fn new(port: u16) -> (Self, NetworkDriver) {
        let status = NetworkStatus::new(port);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let binding = Self {
            status: status.clone(),
            events: Some(UnboundedReceiverStream::new(event_rx)),
            shutdown: shutdown_tx,
        };
        let driver = NetworkDriver {
            status,
            events: event_tx,
            shutdown: shutdown_rx,
        };
        (binding, driver)
    }

    pub fn port(&self) -> u16 {
        self.status.port()
    }

    pub fn status(&self) -> NetworkStatus {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.status.is_connecting()
    }

    /// Take the event stream. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<NetworkEvents> {
        self.events.take()
    }

    /// Leave the network.
    pub fn leave(self) {
        drop(self);
    }
}

impl Drop for NetworkBinding {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Engine side of a [`NetworkBinding`].
#[derive(Clone)]
pub struct NetworkDriver {
    status: NetworkStatus,
    events: mpsc::UnboundedSender<NetworkEvent>,
    shutdown: watch::Receiver<bool>,
}

impl NetworkDriver {
    pub fn port(&self) -> u16 {
        self.status.port()
    }

    pub fn status(&self) -> &NetworkStatus {
        &self.status
    }

    pub fn listening(&self) {
        self.status.inner.listening.store(true, Ordering::SeqCst);
        let _ = self.events.send(NetworkEvent::Listening {
            port: self.status.port(),
        });
    }

    pub fn fail(&self, fault: NetworkFault) {
        self.status.inner.connecting.store(false, Ordering::SeqCst);
        let _ = self.events.send(NetworkEvent::Error(fault));
    }

    pub fn set_connecting(&self, connecting: bool) {
        self.status.inner.connecting.store(connecting, Ordering::SeqCst);
    }

    pub fn peer_connected(&self, peer: SocketAddr) {
        self.status.inner.peers.fetch_add(1, Ordering::SeqCst);
        self.status.inner.connected.store(true, Ordering::SeqCst);
        self.status.inner.connecting.store(false, Ordering::SeqCst);
        let _ = self.events.send(NetworkEvent::Connection { peer });
    }

    pub fn peer_disconnected(&self) {
        let previous = self
            .status
            .inner
            .peers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous <= 1 {
            self.status.inner.connected.store(false, Ordering::SeqCst);
        }
    }

    /// True once the binding has been dropped.
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait until the binding is dropped.
    pub async fn closed(&mut self) {
        while !*self.shutdown.borrow_and_update() {
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}
