//! Local TCP engine.
//!
//! Durable archives live in directories (see [`super::content`]). Joining the
//! network binds a real TCP listener, so a taken port surfaces as
//! `address in use`. Archives that hold content announce themselves by
//! writing `<announce_dir>/<discovery key>/<port>`; archives looking for
//! peers scan that directory and dial what they find. Content moves over the
//! frames in [`super::wire`].

use super::base::ArchiveCore;
use super::keys;
use super::network::{NetworkBinding, NetworkDriver, NetworkFault};
use super::traits::*;
use super::wire::{read_frame, write_frame, Request, Response, READ_CHUNK};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

const PEER_POLL: Duration = Duration::from_millis(200);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Engine backed by the local filesystem and TCP.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    announce_dir: PathBuf,
    bind_host: IpAddr,
    connect_timeout: Duration,
    read_chunk: usize,
}

impl LocalEngine {
    pub fn new(announce_dir: impl Into<PathBuf>) -> Self {
        Self {
            announce_dir: announce_dir.into(),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_chunk: READ_CHUNK,
        }
    }

    pub fn with_bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = host;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bytes requested per ranged read, capped at [`READ_CHUNK`].
    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.clamp(1, READ_CHUNK);
        self
    }
}

#[async_trait]
impl ArchiveEngine for LocalEngine {
    async fn generate_key(&self, secret_dir: &Path) -> EngineResult<ArchiveKey> {
        keys::generate_keypair(secret_dir).await
    }

    async fn open_archive(&self, options: ArchiveOptions) -> EngineResult<Arc<dyn Archive>> {
        let core = ArchiveCore::open(options).await?;
        Ok(Arc::new(LocalArchive {
            inner: Arc::new(LocalState {
                core,
                engine: self.clone(),
                peers: Mutex::new(Vec::new()),
            }),
        }))
    }
}

/// Archive served by [`LocalEngine`].
pub struct LocalArchive {
    inner: Arc<LocalState>,
}

struct LocalState {
    core: ArchiveCore,
    engine: LocalEngine,
    /// Peers that completed a handshake, in connection order.
    peers: Mutex<Vec<SocketAddr>>,
}

impl LocalState {
    fn swarm_dir(&self) -> PathBuf {
        self.engine.announce_dir.join(self.core.key.discovery_key())
    }

    fn advertised_addr(&self, port: u16) -> SocketAddr {
        let host = if self.engine.bind_host.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.engine.bind_host
        };
        SocketAddr::new(host, port)
    }

    fn known_peers(&self) -> Vec<SocketAddr> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn add_peer(&self, addr: SocketAddr) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }

    async fn announce(&self, port: u16) -> io::Result<PathBuf> {
        let dir = self.swarm_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(port.to_string());
        tokio::fs::write(&path, self.advertised_addr(port).to_string()).await?;
        Ok(path)
    }

    /// Addresses announced for this key, excluding `own_port`.
    async fn announced_peers(&self, own_port: u16) -> Vec<SocketAddr> {
        let mut found = Vec::new();
        let mut dir = match tokio::fs::read_dir(self.swarm_dir()).await {
            Ok(dir) => dir,
            Err(_) => return found,
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            if entry.file_name().to_str() == Some(own_port.to_string().as_str()) {
                continue;
            }
            let Ok(raw) = tokio::fs::read_to_string(entry.path()).await else {
                continue;
            };
            if let Ok(addr) = raw.trim().parse() {
                found.push(addr);
            }
        }
        found
    }

    async fn connect(&self, addr: SocketAddr) -> EngineResult<TcpStream> {
        let mut stream = tokio::time::timeout(self.engine.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
        let hello = Request::Hello {
            discovery_key: self.core.key.discovery_key(),
        };
        write_frame(&mut stream, &hello).await?;
        match read_frame(&mut stream).await? {
            Response::Welcome => Ok(stream),
            Response::Error { message } => Err(EngineError::Protocol(message)),
            other => Err(EngineError::Protocol(format!("unexpected handshake reply: {:?}", other))),
        }
    }

    /// Send `request` to the first known peer that answers.
    async fn request(&self, request: &Request) -> EngineResult<Response> {
        let peers = self.known_peers();
        if peers.is_empty() {
            return Err(EngineError::NoPeers);
        }
        let mut last_error = EngineError::NoPeers;
        for addr in peers {
            let attempt = async {
                let mut stream = self.connect(addr).await?;
                write_frame(&mut stream, request).await?;
                read_frame::<_, Response>(&mut stream).await
            };
            match attempt.await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!(peer = %addr, error = %e, "peer request failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn fetch_manifest(&self) -> EngineResult<()> {
        match self.request(&Request::Manifest).await? {
            Response::Manifest { files, version } => self.core.apply_manifest(files, version).await,
            Response::Error { message } => Err(EngineError::Protocol(message)),
            other => Err(EngineError::Protocol(format!("unexpected manifest reply: {:?}", other))),
        }
    }

    /// Fetch `path` from peers in ranged reads.
    async fn fetch_file(&self, path: &str) -> EngineResult<Vec<u8>> {
        let chunk = self.engine.read_chunk;
        let mut data = Vec::new();
        loop {
            let request = Request::Read {
                path: path.to_string(),
                offset: data.len() as u64,
                len: chunk as u64,
            };
            let (hex, total) = match self.request(&request).await? {
                Response::Data { hex, total } => (hex, total),
                Response::Error { .. } => return Err(EngineError::FileNotFound(path.to_string())),
                other => {
                    return Err(EngineError::Protocol(format!("unexpected read reply: {:?}", other)))
                }
            };
            let bytes = hex::decode(hex).map_err(|e| EngineError::Protocol(e.to_string()))?;
            if bytes.is_empty() && (data.len() as u64) < total {
                return Err(EngineError::Protocol(format!(
                    "{} ended at {} of {} bytes",
                    path,
                    data.len(),
                    total
                )));
            }
            data.extend_from_slice(&bytes);
            if data.len() as u64 >= total {
                return Ok(data);
            }
        }
    }

    async fn dial(&self, driver: &NetworkDriver) {
        let port = driver.port();
        loop {
            let mut candidates = self.announced_peers(port).await;
            candidates.shuffle(&mut rand::thread_rng());
            for addr in candidates {
                match self.connect(addr).await {
                    Ok(_) => {
                        self.add_peer(addr);
                        driver.peer_connected(addr);
                        tracing::debug!(key = %self.core.key, peer = %addr, "connected to peer");
                        if !self.core.has_metadata() {
                            if let Err(e) = self.fetch_manifest().await {
                                tracing::warn!(key = %self.core.key, error = %e, "metadata fetch failed");
                            }
                        }
                        return;
                    }
                    Err(e) => tracing::debug!(peer = %addr, error = %e, "handshake failed"),
                }
            }
            tokio::time::sleep(PEER_POLL).await;
        }
    }

    async fn serve(&self, mut stream: TcpStream, addr: SocketAddr, driver: &NetworkDriver) {
        match read_frame::<_, Request>(&mut stream).await {
            Ok(Request::Hello { discovery_key }) if discovery_key == self.core.key.discovery_key() => {}
            Ok(_) => {
                let reply = Response::Error {
                    message: "unknown archive".to_string(),
                };
                let _ = write_frame(&mut stream, &reply).await;
                return;
            }
            Err(_) => return,
        }
        if write_frame(&mut stream, &Response::Welcome).await.is_err() {
            return;
        }
        driver.peer_connected(addr);

        while let Ok(request) = read_frame::<_, Request>(&mut stream).await {
            let reply = self.answer(request).await;
            if write_frame(&mut stream, &reply).await.is_err() {
                break;
            }
        }
        driver.peer_disconnected();
    }

    async fn answer(&self, request: Request) -> Response {
        let error = |e: EngineError| Response::Error {
            message: e.to_string(),
        };
        match request {
            Request::Hello { .. } => Response::Welcome,
            Request::Manifest => match self.core.content.list().await {
                Ok(files) => Response::Manifest {
                    files,
                    version: self.core.content.version(),
                },
                Err(e) => error(e),
            },
            Request::Read { path, offset, len } => {
                let len = (len as usize).min(READ_CHUNK);
                match self.core.content.read_range(&path, offset, len).await {
                    Ok(Some((data, total))) => Response::Data {
                        hex: hex::encode(data),
                        total,
                    },
                    Ok(None) => error(EngineError::FileNotFound(path)),
                    Err(e) => error(e),
                }
            }
        }
    }

    async fn accept(self: &Arc<Self>, listener: &TcpListener, driver: &NetworkDriver) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let state = self.clone();
                    let driver = driver.clone();
                    tokio::spawn(async move { state.serve(stream, addr, &driver).await });
                }
                Err(e) => {
                    driver.fail(NetworkFault::Other(e.to_string()));
                    return;
                }
            }
        }
    }

    async fn run_binding(self: Arc<Self>, listener: TcpListener, driver: NetworkDriver) {
        let port = driver.port();
        let announced = if self.core.storage.is_durable() {
            match self.announce(port).await {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::warn!(key = %self.core.key, port, error = %e, "announce failed");
                    None
                }
            }
        } else {
            None
        };

        let seeking = !self.core.writable;
        driver.set_connecting(seeking);
        driver.listening();

        let mut watcher = driver.clone();
        let serve = async {
            tokio::join!(self.accept(&listener, &driver), async {
                if seeking {
                    self.dial(&driver).await;
                }
            })
        };
        tokio::select! {
            _ = watcher.closed() => {}
            _ = serve => {}
        }

        if let Some(path) = announced {
            let _ = tokio::fs::remove_file(path).await;
        }
        tracing::debug!(key = %self.core.key, port, "left network");
    }
}

#[async_trait]
impl Archive for LocalArchive {
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
        self.inner.fetch_manifest().await
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
        let data = self.inner.fetch_file(path).await?;
        self.inner.core.store(path, &data).await?;
        Ok(data)
    }

    async fn list_files(&self) -> EngineResult<Vec<String>> {
        self.inner.core.list_files().await
    }

    async fn join_network(&self, port: u16) -> EngineResult<NetworkBinding> {
        self.inner.core.ensure_open()?;
        let (binding, driver) = NetworkBinding::new(port);
        match TcpListener::bind(SocketAddr::new(self.inner.engine.bind_host, port)).await {
            Ok(listener) => {
                tokio::spawn(self.inner.clone().run_binding(listener, driver));
            }
            Err(e) => driver.fail(NetworkFault::from_io(port, &e)),
        }
        Ok(binding)
    }

    async fn close(&self) -> EngineResult<()> {
        self.inner.core.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::network::NetworkEvent;
    use futures::StreamExt;
    use tempfile::TempDir;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn engine(dir: &TempDir) -> LocalEngine {
        LocalEngine::new(dir.path().join("announce"))
            .with_bind_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn test_reader_fetches_from_writer() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let secrets = dir.path().join("secrets");
        let key = engine.generate_key(&secrets).await.unwrap();

        let writer = engine
            .open_archive(ArchiveOptions::durable(key, dir.path().join("w")).with_secret_dir(&secrets))
            .await
            .unwrap();
        writer.write_file("hello.txt", b"hi there").await.unwrap();
        let mut writer_binding = writer.join_network(free_port()).await.unwrap();
        let mut writer_events = writer_binding.take_events().unwrap();
        assert!(matches!(
            writer_events.next().await,
            Some(NetworkEvent::Listening { .. })
        ));

        let reader = engine
            .open_archive(ArchiveOptions::volatile(key))
            .await
            .unwrap();
        let mut updates = reader.subscribe();
        let mut reader_binding = reader.join_network(free_port()).await.unwrap();
        let mut events = reader_binding.take_events().unwrap();
        assert!(matches!(events.next().await, Some(NetworkEvent::Listening { .. })));
        let connected = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap();
        assert!(matches!(connected, Some(NetworkEvent::Connection { .. })));

        let synced = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(synced, ArchiveEvent::MetadataSynced { .. }));
        assert_eq!(reader.list_files().await.unwrap(), vec!["hello.txt"]);
        assert_eq!(reader.read_file("hello.txt").await.unwrap(), b"hi there");
    }

    #[tokio::test]
    async fn test_large_file_moves_in_ranged_reads() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let secrets = dir.path().join("secrets");
        let key = engine.generate_key(&secrets).await.unwrap();
        let content: Vec<u8> = (0..100_003u32).map(|i| (i % 251) as u8).collect();

        let writer = engine
            .open_archive(ArchiveOptions::durable(key, dir.path().join("w")).with_secret_dir(&secrets))
            .await
            .unwrap();
        writer.write_file("big.bin", &content).await.unwrap();
        let mut writer_binding = writer.join_network(free_port()).await.unwrap();
        let mut writer_events = writer_binding.take_events().unwrap();
        writer_events.next().await;

        // Every reply carries at most 4 KiB, so the file spans many frames.
        let reader = engine
            .clone()
            .with_read_chunk(4096)
            .open_archive(ArchiveOptions::volatile(key))
            .await
            .unwrap();
        let mut updates = reader.subscribe();
        let _reader_binding = reader.join_network(free_port()).await.unwrap();
        let synced = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(synced, ArchiveEvent::MetadataSynced { .. }));

        let fetched = reader.read_file("big.bin").await.unwrap();
        assert_eq!(fetched.len(), content.len());
        assert_eq!(fetched, content);
        assert_eq!(reader.stats().progress(), 1.0);
    }

    #[tokio::test]
    async fn test_taken_port_reports_address_in_use() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let archive = engine
            .open_archive(ArchiveOptions::volatile(ArchiveKey::from_bytes(&[1u8; 32]).unwrap()))
            .await
            .unwrap();
        let mut binding = archive.join_network(port).await.unwrap();
        let mut events = binding.take_events().unwrap();
        assert_eq!(
            events.next().await,
            Some(NetworkEvent::Error(NetworkFault::AddressInUse(port)))
        );
    }

    #[tokio::test]
    async fn test_announce_removed_on_leave() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let key = ArchiveKey::from_bytes(&[2u8; 32]).unwrap();
        let archive = engine
            .open_archive(ArchiveOptions::durable(key, dir.path().join("a")))
            .await
            .unwrap();
        let port = free_port();
        let mut binding = archive.join_network(port).await.unwrap();
        let mut events = binding.take_events().unwrap();
        events.next().await;

        let announce = dir
            .path()
            .join("announce")
            .join(key.discovery_key())
            .join(port.to_string());
        assert!(announce.exists());

        binding.leave();
        tokio::time::timeout(Duration::from_secs(2), async {
            while announce.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
