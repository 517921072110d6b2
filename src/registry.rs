//! In-memory map of live archive handles.
//!
//! At most one handle per key. Presence checks and the inserts that depend on
//! them happen under one write lock, with no await in between.

use crate::engine::ArchiveKey;
use crate::handle::ArchiveHandle;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Outcome of [`Registry::claim`].
#[derive(Debug)]
pub enum Claim {
    Inserted,
    /// A handle for the key was already registered; nothing was inserted.
    Existing(ArchiveHandle),
}

#[derive(Default)]
pub struct Registry {
    handles: RwLock<HashMap<ArchiveKey, ArchiveHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ArchiveKey, ArchiveHandle>> {
        self.handles.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ArchiveKey, ArchiveHandle>> {
        self.handles.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &ArchiveKey) -> Option<ArchiveHandle> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &ArchiveKey) -> bool {
        self.read().contains_key(key)
    }

    /// Insert `handle` unless its key is already registered.
    pub fn claim(&self, handle: ArchiveHandle) -> Claim {
        let mut handles = self.write();
        if let Some(existing) = handles.get(&handle.key()) {
            return Claim::Existing(existing.clone());
        }
        handles.insert(handle.key(), handle);
        Claim::Inserted
    }

    /// Insert `handle`, returning the handle it displaced.
    pub fn replace(&self, handle: ArchiveHandle) -> Option<ArchiveHandle> {
        self.write().insert(handle.key(), handle)
    }

    /// Swap `current` for `next` only while `current` is still registered.
    pub fn replace_instance(&self, current: &ArchiveHandle, next: ArchiveHandle) -> bool {
        let mut handles = self.write();
        match handles.get(&current.key()) {
            Some(live) if live.same_instance(current) => {
                handles.insert(next.key(), next);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &ArchiveKey) -> Option<ArchiveHandle> {
        self.write().remove(key)
    }

    /// Remove `handle` if it is the registered instance for its key.
    pub fn remove_instance(&self, handle: &ArchiveHandle) -> bool {
        let mut handles = self.write();
        match handles.get(&handle.key()) {
            Some(live) if live.same_instance(handle) => {
                handles.remove(&handle.key());
                true
            }
            _ => false,
        }
    }

    /// Every live handle, ordered by key.
    pub fn all(&self) -> Vec<ArchiveHandle> {
        let mut handles: Vec<_> = self.read().values().cloned().collect();
        handles.sort_by_key(ArchiveHandle::key);
        handles
    }

    /// Remove and return every handle.
    pub fn drain(&self) -> Vec<ArchiveHandle> {
        self.write().drain().map(|(_, handle)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
