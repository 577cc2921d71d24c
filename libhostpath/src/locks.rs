//! Per-volume serialization.
//!
//! Loop attach/detach and mount/unmount for one volume must never interleave,
//! otherwise concurrent requests can leak a loop device or a mount point.
//! [`VolumeLocks`] hands out one async mutex per volume ID.  Entries are
//! dropped once no task holds or waits on them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of per-key async mutexes.
#[derive(Default)]
pub struct VolumeLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Guard returned by [`VolumeLocks::lock`]; releases the key on drop.
pub struct VolumeGuard<'a> {
    key: String,
    table: &'a VolumeLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other task holds `key`, then hold it until the returned
    /// guard is dropped.
    pub async fn lock(&self, key: &str) -> VolumeGuard<'_> {
        let mutex = self.locks.entry(key.to_owned()).or_default().clone();
        let guard = mutex.lock_owned().await;
        VolumeGuard {
            key: key.to_owned(),
            table: self,
            guard: Some(guard),
        }
    }

    fn release(&self, key: &str) {
        // Only the table itself references an idle entry.
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for VolumeGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table.release(&self.key);
    }
}
