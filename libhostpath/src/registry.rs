//! In-memory volume and snapshot registry.
//!
//! The registry is the single source of truth for which volumes and
//! snapshots exist on this node.  It is memory-only: state is lost on
//! restart.  Each record map is paired with a name → ID index that is updated
//! inside the same critical section, so lookups by name are O(1) and a name
//! can never resolve to a deleted record.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::CsiError;
use crate::types::{Snapshot, Volume, VolumeId};

#[derive(Default)]
struct Inner {
    volumes: HashMap<VolumeId, Volume>,
    volume_names: HashMap<String, VolumeId>,
    snapshots: HashMap<String, Snapshot>,
    snapshot_names: HashMap<String, String>,
}

/// Lock-guarded owner of all [`Volume`] and [`Snapshot`] records.
///
/// Shared between the controller and node services behind an `Arc`.
#[derive(Default)]
pub struct VolumeRegistry {
    inner: RwLock<Inner>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Volumes
    // -----------------------------------------------------------------------

    /// Insert a new volume record.
    ///
    /// Fails with [`CsiError::VolumeAlreadyExists`] when the ID is taken or the
    /// name belongs to another live volume.
    pub fn create_volume(&self, volume: Volume) -> Result<(), CsiError> {
        let mut inner = self.inner.write();
        if inner.volumes.contains_key(&volume.volume_id) {
            return Err(CsiError::VolumeAlreadyExists(volume.volume_id.to_string()));
        }
        if inner.volume_names.contains_key(&volume.name) {
            return Err(CsiError::VolumeAlreadyExists(volume.name.clone()));
        }
        debug!(volume_id = %volume.volume_id, name = %volume.name, "volume record created");
        inner
            .volume_names
            .insert(volume.name.clone(), volume.volume_id.clone());
        inner.volumes.insert(volume.volume_id.clone(), volume);
        Ok(())
    }

    pub fn volume(&self, volume_id: &VolumeId) -> Result<Volume, CsiError> {
        self.inner
            .read()
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))
    }

    pub fn volume_by_name(&self, name: &str) -> Result<Volume, CsiError> {
        let inner = self.inner.read();
        inner
            .volume_names
            .get(name)
            .and_then(|id| inner.volumes.get(id))
            .cloned()
            .ok_or_else(|| CsiError::VolumeNotFound(format!("with name {name}")))
    }

    /// Replace an existing record.  The access type of a volume never
    /// changes; an update attempting it is rejected.
    pub fn update_volume(&self, volume: Volume) -> Result<(), CsiError> {
        let mut inner = self.inner.write();
        let Some(current) = inner.volumes.get(&volume.volume_id) else {
            return Err(CsiError::VolumeNotFound(volume.volume_id.to_string()));
        };
        if current.access_type != volume.access_type {
            return Err(CsiError::invalid(format!(
                "access type of volume {} is immutable",
                volume.volume_id
            )));
        }
        if current.name != volume.name {
            if inner.volume_names.contains_key(&volume.name) {
                return Err(CsiError::VolumeAlreadyExists(volume.name.clone()));
            }
            let old_name = current.name.clone();
            inner.volume_names.remove(&old_name);
            inner
                .volume_names
                .insert(volume.name.clone(), volume.volume_id.clone());
        }
        debug!(volume_id = %volume.volume_id, size_bytes = volume.size_bytes, "volume record updated");
        inner.volumes.insert(volume.volume_id.clone(), volume);
        Ok(())
    }

    /// Remove a volume record.  Removing an unknown ID is not an error; the
    /// removed record, if any, is returned.
    pub fn delete_volume(&self, volume_id: &VolumeId) -> Option<Volume> {
        let mut inner = self.inner.write();
        let removed = inner.volumes.remove(volume_id)?;
        inner.volume_names.remove(&removed.name);
        debug!(%volume_id, "volume record deleted");
        Some(removed)
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.inner.read().volumes.values().cloned().collect()
    }

    pub fn volume_count(&self) -> usize {
        self.inner.read().volumes.len()
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn create_snapshot(&self, snapshot: Snapshot) -> Result<(), CsiError> {
        let mut inner = self.inner.write();
        if inner.snapshots.contains_key(&snapshot.snapshot_id) {
            return Err(CsiError::SnapshotAlreadyExists(snapshot.snapshot_id.clone()));
        }
        if inner.snapshot_names.contains_key(&snapshot.name) {
            return Err(CsiError::SnapshotAlreadyExists(snapshot.name.clone()));
        }
        inner
            .snapshot_names
            .insert(snapshot.name.clone(), snapshot.snapshot_id.clone());
        inner
            .snapshots
            .insert(snapshot.snapshot_id.clone(), snapshot);
        Ok(())
    }

    pub fn snapshot(&self, snapshot_id: &str) -> Result<Snapshot, CsiError> {
        self.inner
            .read()
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| CsiError::SnapshotNotFound(snapshot_id.to_owned()))
    }

    pub fn snapshot_by_name(&self, name: &str) -> Result<Snapshot, CsiError> {
        let inner = self.inner.read();
        inner
            .snapshot_names
            .get(name)
            .and_then(|id| inner.snapshots.get(id))
            .cloned()
            .ok_or_else(|| CsiError::SnapshotNotFound(format!("with name {name}")))
    }

    pub fn update_snapshot(&self, snapshot: Snapshot) -> Result<(), CsiError> {
        let mut inner = self.inner.write();
        let Some(current) = inner.snapshots.get(&snapshot.snapshot_id) else {
            return Err(CsiError::SnapshotNotFound(snapshot.snapshot_id.clone()));
        };
        if current.name != snapshot.name {
            if inner.snapshot_names.contains_key(&snapshot.name) {
                return Err(CsiError::SnapshotAlreadyExists(snapshot.name.clone()));
            }
            let old_name = current.name.clone();
            inner.snapshot_names.remove(&old_name);
            inner
                .snapshot_names
                .insert(snapshot.name.clone(), snapshot.snapshot_id.clone());
        }
        inner
            .snapshots
            .insert(snapshot.snapshot_id.clone(), snapshot);
        Ok(())
    }

    /// Remove a snapshot record; idempotent like [`Self::delete_volume`].
    pub fn delete_snapshot(&self, snapshot_id: &str) -> Option<Snapshot> {
        let mut inner = self.inner.write();
        let removed = inner.snapshots.remove(snapshot_id)?;
        inner.snapshot_names.remove(&removed.name);
        Some(removed)
    }

    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        self.inner.read().snapshots.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::SystemTime;

    use super::*;
    use crate::types::AccessType;

    fn volume(id: &str, name: &str) -> Volume {
        Volume {
            volume_id: VolumeId::from(id),
            name: name.to_owned(),
            size_bytes: 1024,
            path: PathBuf::from(format!("/data/{id}")),
            access_type: AccessType::Mount,
            ephemeral: false,
        }
    }

    fn snapshot(id: &str, name: &str, ready: bool) -> Snapshot {
        Snapshot {
            snapshot_id: id.to_owned(),
            name: name.to_owned(),
            source_volume_id: VolumeId::from("v1"),
            path: PathBuf::from(format!("/data/{id}.tgz")),
            creation_time: SystemTime::now(),
            size_bytes: 10,
            ready_to_use: ready,
        }
    }

    #[test]
    fn create_and_lookup() {
        let reg = VolumeRegistry::new();
        reg.create_volume(volume("v1", "vol-a")).unwrap();

        assert_eq!(reg.volume(&"v1".into()).unwrap().name, "vol-a");
        assert_eq!(reg.volume_by_name("vol-a").unwrap().volume_id, "v1".into());
        assert!(matches!(
            reg.volume(&"v2".into()),
            Err(CsiError::VolumeNotFound(_))
        ));
        assert!(reg.volume_by_name("vol-b").unwrap_err().is_not_found());
    }

    #[test]
    fn duplicate_id_or_name_rejected() {
        let reg = VolumeRegistry::new();
        reg.create_volume(volume("v1", "vol-a")).unwrap();

        let err = reg.create_volume(volume("v1", "vol-b")).unwrap_err();
        assert!(err.is_already_exists());
        let err = reg.create_volume(volume("v2", "vol-a")).unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(reg.volume_count(), 1);
    }

    #[test]
    fn update_keeps_name_index_consistent() {
        let reg = VolumeRegistry::new();
        reg.create_volume(volume("v1", "vol-a")).unwrap();

        let mut renamed = volume("v1", "vol-renamed");
        renamed.size_bytes = 4096;
        reg.update_volume(renamed).unwrap();

        assert!(reg.volume_by_name("vol-a").is_err());
        let vol = reg.volume_by_name("vol-renamed").unwrap();
        assert_eq!(vol.size_bytes, 4096);

        let missing = reg.update_volume(volume("v9", "x")).unwrap_err();
        assert!(missing.is_not_found());
    }

    #[test]
    fn update_cannot_change_access_type() {
        let reg = VolumeRegistry::new();
        reg.create_volume(volume("v1", "vol-a")).unwrap();

        let mut block = volume("v1", "vol-a");
        block.access_type = AccessType::Block;
        assert!(matches!(
            reg.update_volume(block),
            Err(CsiError::InvalidArgument(_))
        ));
        assert_eq!(
            reg.volume(&"v1".into()).unwrap().access_type,
            AccessType::Mount
        );
    }

    #[test]
    fn delete_is_idempotent_and_frees_name() {
        let reg = VolumeRegistry::new();
        reg.create_volume(volume("v1", "vol-a")).unwrap();

        assert!(reg.delete_volume(&"v1".into()).is_some());
        assert!(reg.delete_volume(&"v1".into()).is_none());
        assert!(reg.delete_volume(&"never".into()).is_none());

        // The name is free again once the volume is gone.
        reg.create_volume(volume("v2", "vol-a")).unwrap();
        assert_eq!(reg.volume_by_name("vol-a").unwrap().volume_id, "v2".into());
    }

    #[test]
    fn snapshot_records() {
        let reg = VolumeRegistry::new();
        reg.create_snapshot(snapshot("s1", "snap-a", false)).unwrap();
        assert!(
            reg.create_snapshot(snapshot("s2", "snap-a", true))
                .unwrap_err()
                .is_already_exists()
        );

        let mut ready = reg.snapshot("s1").unwrap();
        assert!(!ready.ready_to_use);
        ready.ready_to_use = true;
        reg.update_snapshot(ready).unwrap();
        assert!(reg.snapshot_by_name("snap-a").unwrap().ready_to_use);

        assert!(reg.delete_snapshot("s1").is_some());
        assert!(reg.delete_snapshot("s1").is_none());
        assert!(matches!(
            reg.snapshot("s1"),
            Err(CsiError::SnapshotNotFound(_))
        ));
        assert!(reg.list_snapshots().is_empty());
    }
}
