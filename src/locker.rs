//! Fingerprint-keyed lock pool.
//!
//! Every task-scoped critical section in the engine takes a read or write
//! lock on the task fingerprint. Locks are created lazily and pruned once
//! nothing outside the pool holds them, so the map does not grow with the
//! lifetime of the process.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// A pool of per-key async reader/writer locks.
///
/// Guards are owned so they can be held across `.await` points.
pub struct LockerPool {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl LockerPool {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn entry(&self, key: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquires the shared lock for `key`.
    pub async fn read(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.entry(key).read_owned().await
    }

    /// Acquires the exclusive lock for `key`.
    pub async fn write(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.entry(key).write_owned().await
    }

    /// Drops lock entries that nothing outside the pool references.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for LockerPool {
    fn default() -> Self {
        Self::new()
    }
}
