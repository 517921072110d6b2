//! Simulated archive engine for testing.
//!
//! Archives opened by one [`MockEngine`] share a [`MockSwarm`]: durable
//! archives that join the network become providers for their key, and tests
//! can seed static providers, mark ports busy, slow peers down, or make a key
//! unreachable. Durable storage is real (a [`ContentStore`] on disk), so the
//! manager's filesystem effects are observable.

use super::content::ContentStore;
use super::base::ArchiveCore;
use super::keys;
use super::network::{NetworkBinding, NetworkDriver, NetworkFault};
use super::traits::*;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

const PEER_POLL: Duration = Duration::from_millis(20);

/// How the swarm treats peer lookups for a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerBehavior {
    /// Connect as soon as a provider exists.
    #[default]
    Reachable,
    /// Keep looking forever without connecting.
    ConnectingOnly,
    /// Give up immediately: neither connected nor connecting.
    Offline,
}

#[derive(Clone)]
struct Provider {
    id: u64,
    addr: SocketAddr,
    content: Arc<ContentStore>,
}

#[derive(Default)]
struct SwarmState {
    seeded: HashMap<ArchiveKey, Arc<ContentStore>>,
    joined: HashMap<ArchiveKey, Vec<Provider>>,
    busy_ports: HashSet<u16>,
    behavior: HashMap<ArchiveKey, PeerBehavior>,
    withheld: HashSet<ArchiveKey>,
    stalled: HashSet<ArchiveKey>,
    hidden: HashMap<ArchiveKey, HashSet<String>>,
    connect_delay: Duration,
    metadata_delay: Duration,
    joins: Vec<(ArchiveKey, u16)>,
    next_id: u64,
}

/// Shared state of simulated peers.
#[derive(Clone, Default)]
pub struct MockSwarm {
    state: Arc<Mutex<SwarmState>>,
}

impl MockSwarm {
    fn lock(&self) -> MutexGuard<'_, SwarmState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put a static provider for `key` holding `files` (for test setup).
    pub fn seed<I, P>(&self, key: ArchiveKey, files: I)
    where
        I: IntoIterator<Item = (P, Vec<u8>)>,
        P: Into<String>,
    {
        let content = Arc::new(ContentStore::memory_with(files));
        self.lock().seeded.insert(key, content);
    }

    pub fn unseed(&self, key: &ArchiveKey) {
        self.lock().seeded.remove(key);
    }

    pub fn set_behavior(&self, key: ArchiveKey, behavior: PeerBehavior) {
        self.lock().behavior.insert(key, behavior);
    }

    /// Make binds on `port` fail with `address in use`.
    pub fn mark_busy(&self, port: u16) {
        self.lock().busy_ports.insert(port);
    }

    pub fn clear_busy(&self, port: u16) {
        self.lock().busy_ports.remove(&port);
    }

    /// Delay between listening and the first peer connection.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Delay between peer connection and metadata sync.
    pub fn set_metadata_delay(&self, delay: Duration) {
        self.lock().metadata_delay = delay;
    }

    /// Peers for `key` connect but never send metadata.
    pub fn withhold_metadata(&self, key: ArchiveKey) {
        self.lock().withheld.insert(key);
    }

    /// Content reads for `key` never complete.
    pub fn stall_reads(&self, key: ArchiveKey) {
        self.lock().stalled.insert(key);
    }

    /// Leave `path` out of file listings of sparse archives for `key`, as if
    /// the tree walk missed it.
    pub fn hide_file(&self, key: ArchiveKey, path: impl Into<String>) {
        self.lock()
            .hidden
            .entry(key)
            .or_default()
            .insert(path.into());
    }

    /// Every successful bind so far, in order.
    pub fn joins(&self) -> Vec<(ArchiveKey, u16)> {
        self.lock().joins.clone()
    }

    /// Ports bound for `key`, in order.
    pub fn join_ports(&self, key: &ArchiveKey) -> Vec<u16> {
        self.lock()
            .joins
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, port)| *port)
            .collect()
    }

    /// Archives currently serving `key` on the network.
    pub fn provider_count(&self, key: &ArchiveKey) -> usize {
        self.lock().joined.get(key).map_or(0, Vec::len)
    }

    fn next_id(&self) -> u64 {
        let mut state = self.lock();
        state.next_id += 1;
        state.next_id
    }

    fn register(&self, key: ArchiveKey, port: u16, id: u64, content: Arc<ContentStore>) {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        self.lock()
            .joined
            .entry(key)
            .or_default()
            .push(Provider { id, addr, content });
    }

    fn unregister(&self, key: &ArchiveKey, id: u64) {
        let mut state = self.lock();
        if let Some(providers) = state.joined.get_mut(key) {
            providers.retain(|p| p.id != id);
            if providers.is_empty() {
                state.joined.remove(key);
            }
        }
    }

    fn find_provider(&self, key: &ArchiveKey, exclude: Option<u64>) -> Option<Provider> {
        let state = self.lock();
        let joined = state
            .joined
            .get(key)
            .and_then(|providers| providers.iter().find(|p| Some(p.id) != exclude).cloned());
        joined.or_else(|| {
            state.seeded.get(key).map(|content| Provider {
                id: 0,
                addr: SocketAddr::from(([10, 0, 0, 1], 7000)),
                content: content.clone(),
            })
        })
    }
}

/// Simulated engine.
#[derive(Clone, Default)]
pub struct MockEngine {
    swarm: MockSwarm,
}

impl MockEngine {
    /// Create new mock engine with its own swarm.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine attached to an existing swarm.
    pub fn with_swarm(swarm: MockSwarm) -> Self {
        Self { swarm }
    }

    pub fn swarm(&self) -> &MockSwarm {
        &self.swarm
    }
}

#[async_trait]
impl ArchiveEngine for MockEngine {
    async fn generate_key(&self, secret_dir: &Path) -> EngineResult<ArchiveKey> {
        keys::generate_keypair(secret_dir).await
    }

    async fn open_archive(&self, options: ArchiveOptions) -> EngineResult<Arc<dyn Archive>> {
        let core = ArchiveCore::open(options).await?;
        Ok(Arc::new(MockArchive {
            inner: Arc::new(ArchiveState {
                core,
                swarm: self.swarm.clone(),
            }),
        }))
    }
}

/// Simulated archive.
pub struct MockArchive {
    inner: Arc<ArchiveState>,
}

struct ArchiveState {
    core: ArchiveCore,
    swarm: MockSwarm,
}

impl ArchiveState {
    async fn sync_metadata(&self, source: &ContentStore) -> EngineResult<()> {
        let entries = source.list().await?;
        self.core.apply_manifest(entries, source.version()).await
    }

    async fn seek_peer(&self, driver: &NetworkDriver, id: u64) {
        let key = self.core.key;
        let connect_delay = self.swarm.lock().connect_delay;
        tokio::time::sleep(connect_delay).await;

        let provider = loop {
            if let Some(provider) = self.swarm.find_provider(&key, Some(id)) {
                break provider;
            }
            tokio::time::sleep(PEER_POLL).await;
        };
        driver.peer_connected(provider.addr);

        if self.core.has_metadata() {
            return;
        }
        let (withheld, metadata_delay) = {
            let state = self.swarm.lock();
            (state.withheld.contains(&key), state.metadata_delay)
        };
        if withheld {
            return;
        }
        tokio::time::sleep(metadata_delay).await;
        if let Err(e) = self.sync_metadata(&provider.content).await {
            tracing::warn!(key = %key, error = %e, "simulated metadata sync failed");
        }
    }

    async fn run_binding(self: Arc<Self>, driver: NetworkDriver) {
        let key = self.core.key;
        let port = driver.port();
        let (busy, behavior) = {
            let state = self.swarm.lock();
            (
                state.busy_ports.contains(&port),
                state.behavior.get(&key).copied().unwrap_or_default(),
            )
        };
        if busy {
            driver.fail(NetworkFault::AddressInUse(port));
            return;
        }

        let id = self.swarm.next_id();
        if self.core.storage.is_durable() {
            self.swarm.register(key, port, id, self.core.content.clone());
        }
        self.swarm.lock().joins.push((key, port));

        let seeking = !self.core.writable && behavior != PeerBehavior::Offline;
        driver.set_connecting(seeking);
        driver.listening();

        let mut watcher = driver.clone();
        if seeking && behavior == PeerBehavior::Reachable {
            tokio::select! {
                _ = watcher.closed() => {}
                _ = self.seek_peer(&driver, id) => {}
            }
        }
        watcher.closed().await;
        self.swarm.unregister(&key, id);
    }
}

#[async_trait]
impl Archive for MockArchive {
    fn key(&self) -> ArchiveKey {
        self.inner.core.key
    }

    fn writable(&self) -> bool {
        self.inner.core.writable
    }

    fn storage(&self) -> StorageLocation {
        self.inner.core.storage.clone()
    }

    fn has_metadata(&self) -> bool {
        self.inner.core.has_metadata()
    }

    fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.inner.core.subscribe()
    }

    fn stats(&self) -> ArchiveStats {
        self.inner.core.stats()
    }

    async fn download_metadata(&self) -> EngineResult<()> {
        self.inner.core.ensure_open()?;
        if self.has_metadata() {
            return Ok(());
        }
        let provider = self
            .inner
            .swarm
            .find_provider(&self.key(), None)
            .ok_or(EngineError::NoPeers)?;
        self.inner.sync_metadata(&provider.content).await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> EngineResult<()> {
        self.inner.core.write_file(path, data).await
    }

    async fn read_file(&self, path: &str) -> EngineResult<Vec<u8>> {
        if let Some(data) = self.inner.core.read_local(path).await? {
            return Ok(data);
        }
        if !self.inner.core.sparse {
            return Err(EngineError::FileNotFound(path.to_string()));
        }

        let stalled = self.inner.swarm.lock().stalled.contains(&self.key());
        if stalled {
            std::future::pending::<()>().await;
        }
        let provider = self
            .inner
            .swarm
            .find_provider(&self.key(), None)
            .ok_or(EngineError::NoPeers)?;
        let data = provider
            .content
            .read(path)
            .await?
            .ok_or_else(|| EngineError::FileNotFound(path.to_string()))?;

        self.inner.core.store(path, &data).await?;
        Ok(data)
    }

    async fn list_files(&self) -> EngineResult<Vec<String>> {
        let mut files = self.inner.core.list_files().await?;
        if self.inner.core.sparse {
            let state = self.inner.swarm.lock();
            if let Some(hidden) = state.hidden.get(&self.key()) {
                files.retain(|path| !hidden.contains(path));
            }
        }
        Ok(files)
    }

    async fn join_network(&self, port: u16) -> EngineResult<NetworkBinding> {
        self.inner.core.ensure_open()?;
        let (binding, driver) = NetworkBinding::new(port);
        tokio::spawn(self.inner.clone().run_binding(driver));
        Ok(binding)
    }

    async fn close(&self) -> EngineResult<()> {
        self.inner.core.close();
        Ok(())
    }
}
