//! Archive content storage.
//!
//! Durable archives keep their files in a plain directory next to an
//! `.archive` marker folder; volatile archives keep them in memory. Paths
//! inside an archive are `/`-separated and relative to the archive root.

use super::traits::{blocks_for, ArchiveKey, ArchiveStats, EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Folder whose presence denotes a valid archive root.
pub const ARCHIVE_MARKER: &str = ".archive";

const MARKER_META: &str = "meta.json";

#[derive(Debug, Serialize, Deserialize)]
struct MarkerMeta {
    key: String,
    version: u64,
}

/// A file in an archive's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub len: u64,
}

/// Normalize an archive path: strip leading `/`, reject traversal and the
/// marker folder.
pub fn normalize_path(path: &str) -> EngineResult<String> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(EngineError::InvalidPath(path.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() || parts[0] == ARCHIVE_MARKER {
        return Err(EngineError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

/// True if `root` holds an archive marker.
pub fn marker_exists(root: &Path) -> bool {
    root.join(ARCHIVE_MARKER).is_dir()
}

/// Write the marker folder of `root` for `key` at `version`.
pub async fn write_marker(root: &Path, key: &ArchiveKey, version: u64) -> EngineResult<()> {
    let marker = root.join(ARCHIVE_MARKER);
    tokio::fs::create_dir_all(&marker).await?;
    let meta = MarkerMeta {
        key: key.to_hex(),
        version,
    };
    let raw = serde_json::to_vec_pretty(&meta).map_err(|e| EngineError::Protocol(e.to_string()))?;
    tokio::fs::write(marker.join(MARKER_META), raw).await?;
    Ok(())
}

/// Stats of fully-held content.
pub fn complete_stats(entries: &[FileEntry], version: u64) -> ArchiveStats {
    let byte_length = entries.iter().map(|e| e.len).sum();
    let length = entries.iter().map(|e| blocks_for(e.len)).sum();
    ArchiveStats {
        files: entries.len() as u64,
        byte_length,
        length,
        downloaded: length,
        version,
    }
}

/// Files to import from `src`, paired with their archive paths.
pub async fn import_entries(src: &Path) -> EngineResult<Vec<(PathBuf, String)>> {
    let metadata = tokio::fs::metadata(src).await?;
    if metadata.is_file() {
        let name = src
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EngineError::InvalidPath(src.display().to_string()))?;
        return Ok(vec![(src.to_path_buf(), normalize_path(name)?)]);
    }

    let mut entries = Vec::new();
    for relative in walk_files(src).await? {
        entries.push((src.join(&relative), relative));
    }
    Ok(entries)
}

/// Relative `/`-separated paths of all files under `root`, excluding the
/// archive marker.
async fn walk_files(root: &Path) -> EngineResult<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let mut dir = tokio::fs::read_dir(root.join(&relative)).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if relative.as_os_str().is_empty() && name == ARCHIVE_MARKER {
                continue;
            }
            let child = relative.join(&name);
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                files.push(to_archive_path(&child));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn to_archive_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Backing store for an archive's files.
pub enum ContentStore {
    Disk(DiskContent),
    Memory(MemoryContent),
}

impl ContentStore {
    /// Open (or initialize) durable content at `root` for `key`.
    pub async fn open_disk(root: &Path, key: &ArchiveKey) -> EngineResult<Self> {
        Ok(Self::Disk(DiskContent::open(root, key).await?))
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryContent::default())
    }

    pub fn memory_with<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, Vec<u8>)>,
        P: Into<String>,
    {
        let files = files
            .into_iter()
            .filter_map(|(path, data)| normalize_path(&path.into()).ok().map(|p| (p, data)))
            .collect();
        Self::Memory(MemoryContent {
            files: RwLock::new(files),
            version: AtomicU64::new(1),
        })
    }

    pub async fn read(&self, path: &str) -> EngineResult<Option<Vec<u8>>> {
        let path = normalize_path(path)?;
        match self {
            Self::Disk(disk) => disk.read(&path).await,
            Self::Memory(memory) => Ok(memory.read(&path)),
        }
    }

    /// Up to `len` bytes of `path` starting at `offset`, with the file's
    /// total length.
    pub async fn read_range(
        &self,
        path: &str,
        offset: u64,
        len: usize,
    ) -> EngineResult<Option<(Vec<u8>, u64)>> {
        let path = normalize_path(path)?;
        match self {
            Self::Disk(disk) => disk.read_range(&path, offset, len).await,
            Self::Memory(memory) => Ok(memory.read_range(&path, offset, len)),
        }
    }

    pub async fn write(&self, path: &str, data: &[u8]) -> EngineResult<()> {
        let path = normalize_path(path)?;
        match self {
            Self::Disk(disk) => disk.write(&path, data).await,
            Self::Memory(memory) => {
                memory.write(path, data.to_vec());
                Ok(())
            }
        }
    }

    pub async fn list(&self) -> EngineResult<Vec<FileEntry>> {
        match self {
            Self::Disk(disk) => disk.list().await,
            Self::Memory(memory) => Ok(memory.list()),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Disk(disk) => disk.version.load(Ordering::SeqCst),
            Self::Memory(memory) => memory.version.load(Ordering::SeqCst),
        }
    }

    /// Stats assuming every listed file is held locally.
    pub async fn stats(&self) -> EngineResult<ArchiveStats> {
        let entries = self.list().await?;
        Ok(complete_stats(&entries, self.version()))
    }
}

/// Directory-backed content.
pub struct DiskContent {
    root: PathBuf,
    key: ArchiveKey,
    version: AtomicU64,
}

impl DiskContent {
    async fn open(root: &Path, key: &ArchiveKey) -> EngineResult<Self> {
        let marker = root.join(ARCHIVE_MARKER);
        tokio::fs::create_dir_all(&marker).await?;
        let meta_path = marker.join(MARKER_META);

        let version = match tokio::fs::read(&meta_path).await {
            Ok(raw) => {
                let meta: MarkerMeta = serde_json::from_slice(&raw)
                    .map_err(|e| EngineError::Protocol(format!("corrupt archive marker: {}", e)))?;
                if meta.key != key.to_hex() {
                    return Err(EngineError::KeyMismatch {
                        expected: *key,
                        found: meta.key,
                    });
                }
                meta.version
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let content = Self {
            root: root.to_path_buf(),
            key: *key,
            version: AtomicU64::new(version),
        };
        content.save_meta().await?;
        Ok(content)
    }

    async fn save_meta(&self) -> EngineResult<()> {
        write_marker(&self.root, &self.key, self.version.load(Ordering::SeqCst)).await
    }

    async fn read(&self, path: &str) -> EngineResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.root.join(path)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        len: usize,
    ) -> EngineResult<Option<(Vec<u8>, u64)>> {
        let mut file = match tokio::fs::File::open(self.root.join(path)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let total = file.metadata().await?.len();
        file.seek(SeekFrom::Start(offset.min(total))).await?;
        let mut data = Vec::with_capacity(len.min(total.saturating_sub(offset) as usize));
        file.take(len as u64).read_to_end(&mut data).await?;
        Ok(Some((data, total)))
    }

    async fn write(&self, path: &str, data: &[u8]) -> EngineResult<()> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;
        self.version.fetch_add(1, Ordering::SeqCst);
        self.save_meta().await
    }

    async fn list(&self) -> EngineResult<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for path in walk_files(&self.root).await? {
            let len = tokio::fs::metadata(self.root.join(&path)).await?.len();
            entries.push(FileEntry { path, len });
        }
        Ok(entries)
    }
}

/// In-memory content.
#[derive(Default)]
pub struct MemoryContent {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    version: AtomicU64,
}

impl MemoryContent {
    fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Option<(Vec<u8>, u64)> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let data = files.get(path)?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Some((data[start..end].to_vec(), data.len() as u64))
    }

    fn write(&self, path: String, data: Vec<u8>) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path, data);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn list(&self) -> Vec<FileEntry> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(path, data)| FileEntry {
                path: path.clone(),
                len: data.len() as u64,
            })
            .collect()
    }
}
