//! Port allocation for archive network bindings.
//!
//! Two independent pools (upload, download) each hand out ports from a
//! `[start, end)` range. The upload pool scans from a round-robin cursor; the
//! download pool scans from the range start or from an explicit hint, which
//! makes rebinding deterministic. A scan visits every port of the pool once,
//! wrapping at the range end.
//!
//! Leases release their port when dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Port pool selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortPool {
    Upload,
    Download,
}

impl fmt::Display for PortPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// Half-open port range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Number of ports in the range.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    /// True if the two ranges share a port.
    pub fn overlaps(&self, other: &PortRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Every port in a pool is leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no free port in {pool} pool")]
pub struct PortExhausted {
    pub pool: PortPool,
}

struct PoolState {
    range: PortRange,
    /// Next scan start for round-robin allocation.
    cursor: u16,
    in_use: BTreeSet<u16>,
}

impl PoolState {
    fn new(range: PortRange) -> Self {
        Self {
            range,
            cursor: range.start,
            in_use: BTreeSet::new(),
        }
    }

    /// First free port at or after `from`, wrapping once around the range.
    fn scan(&self, from: u16) -> Option<u16> {
        let len = self.range.len();
        if len == 0 {
            return None;
        }
        let offset = if self.range.contains(from) {
            (from - self.range.start) as usize
        } else {
            0
        };
        (0..len)
            .map(|i| self.range.start + ((offset + i) % len) as u16)
            .find(|port| !self.in_use.contains(port))
    }

    fn next_after(&self, port: u16) -> u16 {
        match port.checked_add(1) {
            Some(next) if self.range.contains(next) => next,
            _ => self.range.start,
        }
    }
}

struct Pools {
    upload: Mutex<PoolState>,
    download: Mutex<PoolState>,
}

/// Owner of the in-use port sets.
#[derive(Clone)]
pub struct PortAllocator {
    pools: Arc<Pools>,
}

impl PortAllocator {
    pub fn new(upload: PortRange, download: PortRange) -> Self {
        Self {
            pools: Arc::new(Pools {
                upload: Mutex::new(PoolState::new(upload)),
                download: Mutex::new(PoolState::new(download)),
            }),
        }
    }

    fn pool(&self, pool: PortPool) -> MutexGuard<'_, PoolState> {
        let mutex = match pool {
            PortPool::Upload => &self.pools.upload,
            PortPool::Download => &self.pools.download,
        };
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lease a port using the pool's default start point.
    pub fn acquire(&self, pool: PortPool) -> Result<PortLease, PortExhausted> {
        self.allocate(pool, None)
    }

    /// Lease a port, scanning from `hint`.
    pub fn acquire_from(&self, pool: PortPool, hint: u16) -> Result<PortLease, PortExhausted> {
        self.allocate(pool, Some(hint))
    }

    fn allocate(&self, pool: PortPool, hint: Option<u16>) -> Result<PortLease, PortExhausted> {
        let mut state = self.pool(pool);
        let from = hint.unwrap_or(match pool {
            PortPool::Upload => state.cursor,
            PortPool::Download => state.range.start,
        });
        let port = state.scan(from).ok_or(PortExhausted { pool })?;
        state.in_use.insert(port);
        if pool == PortPool::Upload {
            state.cursor = state.next_after(port);
        }
        drop(state);

        tracing::trace!(%pool, port, "port leased");
        Ok(PortLease {
            port,
            pool,
            allocator: self.clone(),
        })
    }

    fn release_port(&self, pool: PortPool, port: u16) {
        self.pool(pool).in_use.remove(&port);
        tracing::trace!(%pool, port, "port released");
    }

    /// Ports currently leased from `pool`, ascending.
    pub fn in_use(&self, pool: PortPool) -> Vec<u16> {
        self.pool(pool).in_use.iter().copied().collect()
    }

    /// Number of ports in `pool`.
    pub fn capacity(&self, pool: PortPool) -> usize {
        self.pool(pool).range.len()
    }

    pub fn range(&self, pool: PortPool) -> PortRange {
        self.pool(pool).range
    }
}

/// A leased port. Dropping the lease returns the port to its pool.
pub struct PortLease {
    port: u16,
    pool: PortPool,
    allocator: PortAllocator,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pool(&self) -> PortPool {
        self.pool
    }

    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortLease")
            .field("port", &self.port)
            .field("pool", &self.pool)
            .finish()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release_port(self.pool, self.port);
    }
}
