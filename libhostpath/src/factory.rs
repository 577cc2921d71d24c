//! Volume factory: creates and destroys backing storage.
//!
//! A mount-access volume is a directory `<data_root>/<volume_id>`; a
//! block-access volume is a sparse file at the same path attached to a loop
//! device.  The factory owns the pairing between backing storage and the
//! registry record: a record exists only while its storage does.
//!
//! Both operations run under the per-volume lock so that a concurrent create
//! and delete of the same ID cannot leak a loop device or a directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::DirBuilder;
use tracing::{debug, error, info, instrument, warn};

use crate::config::MIB;
use crate::error::CsiError;
use crate::host::{HostCapabilities, LoopDeviceManager, SpaceAllocator};
use crate::locks::VolumeLocks;
use crate::registry::VolumeRegistry;
use crate::types::{AccessType, Volume, VolumeId};

pub struct VolumeFactory {
    data_root: PathBuf,
    registry: Arc<VolumeRegistry>,
    locks: Arc<VolumeLocks>,
    loop_devices: Arc<dyn LoopDeviceManager>,
    allocator: Arc<dyn SpaceAllocator>,
}

impl VolumeFactory {
    pub fn new(
        data_root: impl Into<PathBuf>,
        registry: Arc<VolumeRegistry>,
        locks: Arc<VolumeLocks>,
        host: &HostCapabilities,
    ) -> Self {
        Self {
            data_root: data_root.into(),
            registry,
            locks,
            loop_devices: Arc::clone(&host.loop_devices),
            allocator: Arc::clone(&host.allocator),
        }
    }

    /// Resolve the backing path for a volume.
    pub fn volume_path(&self, volume_id: &VolumeId) -> PathBuf {
        self.data_root.join(volume_id.as_str())
    }

    /// Create backing storage for a volume and register it.
    ///
    /// Repeating the call with identical `(volume_id, name, size_bytes,
    /// access_type)` returns the existing record.  The same ID with different
    /// parameters, or a name held by another volume, is
    /// [`CsiError::VolumeAlreadyExists`].
    #[instrument(skip(self), fields(volume_id = %volume_id))]
    pub async fn create_volume(
        &self,
        volume_id: &VolumeId,
        name: &str,
        size_bytes: u64,
        access_type: AccessType,
        ephemeral: bool,
    ) -> Result<Volume, CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing"));
        }
        if name.is_empty() {
            return Err(CsiError::invalid("volume name missing"));
        }

        let _guard = self.locks.lock(volume_id.as_str()).await;

        match self.registry.volume(volume_id) {
            Ok(existing) => {
                if existing.name == name
                    && existing.size_bytes == size_bytes
                    && existing.access_type == access_type
                {
                    debug!("returning existing volume for idempotent create");
                    return Ok(existing);
                }
                return Err(CsiError::VolumeAlreadyExists(format!(
                    "{volume_id} with different parameters"
                )));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        if let Ok(owner) = self.registry.volume_by_name(name) {
            return Err(CsiError::VolumeAlreadyExists(format!(
                "name {name} is used by volume {}",
                owner.volume_id
            )));
        }

        let path = self.volume_path(volume_id);
        match access_type {
            AccessType::Mount => {
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o777)
                    .create(&path)
                    .await
                    .map_err(|e| {
                        CsiError::Internal(format!("create directory {}: {e}", path.display()))
                    })?;
            }
            AccessType::Block => self.create_block_file(&path, size_bytes).await?,
        }

        let volume = Volume {
            volume_id: volume_id.clone(),
            name: name.to_owned(),
            size_bytes,
            path,
            access_type,
            ephemeral,
        };
        if let Err(e) = self.registry.create_volume(volume.clone()) {
            // Lost a race on the name against another ID.
            self.release_storage(&volume).await;
            return Err(e);
        }

        info!(%access_type, size_bytes, ephemeral, path = %volume.path.display(), "volume created");
        Ok(volume)
    }

    /// Destroy a volume's backing storage and drop its record.
    ///
    /// Unknown IDs succeed.  For block volumes the loop device is detached
    /// when one is bound; detach failures are logged and do not stop the
    /// deletion.
    #[instrument(skip(self), fields(volume_id = %volume_id))]
    pub async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let _guard = self.locks.lock(volume_id.as_str()).await;

        let volume = match self.registry.volume(volume_id) {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                debug!("volume not registered, nothing to delete");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if volume.access_type == AccessType::Block {
            self.detach_loop_device(&volume.path).await;
        }

        remove_all(&volume.path).await.map_err(|e| {
            CsiError::Internal(format!("remove {}: {e}", volume.path.display()))
        })?;
        self.registry.delete_volume(volume_id);

        info!("volume deleted");
        Ok(())
    }

    async fn create_block_file(&self, path: &Path, size_bytes: u64) -> Result<(), CsiError> {
        let file_size = block_file_size(size_bytes)?;
        if let Err(e) = self.allocator.allocate(path, file_size).await {
            remove_orphan(path).await;
            return Err(CsiError::Internal(format!(
                "failed to create block file {}: {e}",
                path.display()
            )));
        }

        if let Err(e) = self.loop_devices.attach(path).await {
            remove_orphan(path).await;
            return Err(CsiError::Internal(format!(
                "failed to attach device {}: {e}",
                path.display()
            )));
        }
        Ok(())
    }

    async fn detach_loop_device(&self, backing_file: &Path) {
        match self.loop_devices.lookup(backing_file).await {
            Ok(device) => {
                debug!(device = %device.display(), "detaching loop device");
                if let Err(e) = self.loop_devices.detach(&device).await {
                    warn!(device = %device.display(), error = %e, "failed to detach loop device");
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(backing_file = %backing_file.display(), "no loop device attached");
            }
            Err(e) => {
                warn!(backing_file = %backing_file.display(), error = %e, "loop device lookup failed");
            }
        }
    }

    async fn release_storage(&self, volume: &Volume) {
        if volume.access_type == AccessType::Block {
            self.detach_loop_device(&volume.path).await;
        }
        remove_orphan(&volume.path).await;
    }
}

/// Size of the backing file for a block volume: the request rounded up to
/// the next whole MiB, never less than 1 MiB.
pub fn block_file_size(size_bytes: u64) -> Result<u64, CsiError> {
    size_bytes
        .div_ceil(MIB)
        .max(1)
        .checked_mul(MIB)
        .ok_or_else(|| {
            CsiError::OutOfRange(format!(
                "block volume size {size_bytes} cannot be rounded to whole MiB"
            ))
        })
}

/// Remove a file or directory tree.  A missing path is success.
pub(crate) async fn remove_all(path: &Path) -> io::Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn remove_orphan(path: &Path) {
    if let Err(e) = remove_all(path).await {
        error!(path = %path.display(), error = %e, "failed to clean up backing storage");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::FakeHost;

    fn make_factory(root: &Path, host: &FakeHost) -> (VolumeFactory, Arc<VolumeRegistry>) {
        let registry = Arc::new(VolumeRegistry::new());
        let factory = VolumeFactory::new(
            root,
            Arc::clone(&registry),
            Arc::new(VolumeLocks::new()),
            &host.capabilities(),
        );
        (factory, registry)
    }

    #[test]
    fn block_sizes_round_up_to_mib() {
        assert_eq!(block_file_size(0).unwrap(), MIB);
        assert_eq!(block_file_size(1).unwrap(), MIB);
        assert_eq!(block_file_size(10 * MIB).unwrap(), 10 * MIB);
        assert_eq!(block_file_size(10 * MIB + 1).unwrap(), 11 * MIB);
        assert_eq!(block_file_size(u64::MAX - MIB + 1).unwrap(), u64::MAX - MIB + 1);
    }

    #[tokio::test]
    async fn oversized_block_volume_is_out_of_range() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let (factory, registry) = make_factory(tmp.path(), &host);

        assert!(matches!(
            block_file_size(u64::MAX),
            Err(CsiError::OutOfRange(_))
        ));
        let err = factory
            .create_volume(&"huge".into(), "huge", u64::MAX, AccessType::Block, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::OutOfRange(_)));
        assert!(registry.volume(&"huge".into()).unwrap_err().is_not_found());
        assert!(!tmp.path().join("huge").exists());
        assert_eq!(host.loops.attach_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_creates_of_one_volume_attach_once() {
        let tmp = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new());
        let (factory, registry) = make_factory(tmp.path(), &host);
        let factory = Arc::new(factory);
        host.loops.attach_gate.arm();

        let create = |factory: Arc<VolumeFactory>| {
            tokio::spawn(async move {
                factory
                    .create_volume(&"b1".into(), "blk", MIB, AccessType::Block, false)
                    .await
            })
        };
        let first = create(Arc::clone(&factory));
        host.loops.attach_gate.reached().await;

        let second = create(Arc::clone(&factory));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        host.loops.attach_gate.open();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(host.loops.attach_calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.loops.count(), 1);
        assert!(first.path.is_file());
        assert_eq!(registry.volume_count(), 1);
    }

    #[tokio::test]
    async fn delete_waits_for_in_flight_create() {
        let tmp = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new());
        let (factory, registry) = make_factory(tmp.path(), &host);
        let factory = Arc::new(factory);
        host.loops.attach_gate.arm();

        let create = {
            let factory = Arc::clone(&factory);
            tokio::spawn(async move {
                factory
                    .create_volume(&"b1".into(), "blk", MIB, AccessType::Block, false)
                    .await
            })
        };
        host.loops.attach_gate.reached().await;

        let delete = {
            let factory = Arc::clone(&factory);
            tokio::spawn(async move { factory.delete_volume(&"b1".into()).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!delete.is_finished());
        host.loops.attach_gate.open();

        let created = create.await.unwrap().unwrap();
        delete.await.unwrap().unwrap();
        assert!(registry.volume(&"b1".into()).unwrap_err().is_not_found());
        assert!(!created.path.exists());
        assert_eq!(host.loops.count(), 0);
    }

    #[tokio::test]
    async fn mount_volume_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let (factory, registry) = make_factory(tmp.path(), &host);

        let vol = factory
            .create_volume(&"v1".into(), "vol-a", 10 * MIB, AccessType::Mount, false)
            .await
            .unwrap();

        assert_eq!(vol.volume_id, VolumeId::from("v1"));
        assert_eq!(vol.path, tmp.path().join("v1"));
        assert!(vol.path.is_dir());
        assert_eq!(registry.volume(&"v1".into()).unwrap(), vol);
        assert_eq!(host.loops.count(), 0);
    }

    #[tokio::test]
    async fn create_is_idempotent_for_identical_parameters() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let (factory, registry) = make_factory(tmp.path(), &host);

        let first = factory
            .create_volume(&"v1".into(), "vol-a", 4 * MIB, AccessType::Block, false)
            .await
            .unwrap();
        let second = factory
            .create_volume(&"v1".into(), "vol-a", 4 * MIB, AccessType::Block, false)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.volume_count(), 1);
        // The second call must not allocate or attach again.
        assert_eq!(host.loops.count(), 1);
    }

    #[tokio::test]
    async fn conflicting_create_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let (factory, _registry) = make_factory(tmp.path(), &host);

        factory
            .create_volume(&"v1".into(), "vol-a", MIB, AccessType::Mount, false)
            .await
            .unwrap();

        let err = factory
            .create_volume(&"v1".into(), "vol-a", 2 * MIB, AccessType::Mount, false)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        let err = factory
            .create_volume(&"v2".into(), "vol-a", MIB, AccessType::Mount, false)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        assert!(!tmp.path().join("v2").exists());
    }

    #[tokio::test]
    async fn block_volume_allocates_and_attaches() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let (factory, _registry) = make_factory(tmp.path(), &host);

        let vol = factory
            .create_volume(&"b1".into(), "blk", 3 * MIB + 5, AccessType::Block, false)
            .await
            .unwrap();

        assert!(vol.path.is_file());
        assert_eq!(std::fs::metadata(&vol.path).unwrap().len(), 4 * MIB);
        assert_eq!(
            host.allocator.last_size.load(Ordering::SeqCst) as u64,
            4 * MIB
        );
        assert!(host.loops.bound(&vol.path).is_some());
        // The record keeps the requested size, not the rounded one.
        assert_eq!(vol.size_bytes, 3 * MIB + 5);
    }

    #[tokio::test]
    async fn failed_attach_removes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        host.loops.fail_attach.store(true, Ordering::SeqCst);
        let (factory, registry) = make_factory(tmp.path(), &host);

        let err = factory
            .create_volume(&"b1".into(), "blk", MIB, AccessType::Block, false)
            .await
            .unwrap_err();

        assert!(matches!(err, CsiError::Internal(_)));
        assert!(err.to_string().contains("unused loop device"));
        assert!(!tmp.path().join("b1").exists());
        assert!(registry.volume(&"b1".into()).is_err());
    }

    #[tokio::test]
    async fn delete_unknown_volume_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let (factory, _registry) = make_factory(tmp.path(), &host);

        factory.delete_volume(&"missing".into()).await.unwrap();
        assert_eq!(host.loops.detach_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delete_block_volume_detaches_and_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let (factory, registry) = make_factory(tmp.path(), &host);

        let vol = factory
            .create_volume(&"b1".into(), "blk", MIB, AccessType::Block, false)
            .await
            .unwrap();
        factory.delete_volume(&"b1".into()).await.unwrap();

        assert_eq!(host.loops.detach_calls.load(Ordering::SeqCst), 1);
        assert!(host.loops.bound(&vol.path).is_none());
        assert!(!vol.path.exists());
        assert!(registry.volume(&"b1".into()).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_skips_detach_when_no_device_bound() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let (factory, _registry) = make_factory(tmp.path(), &host);

        let vol = factory
            .create_volume(&"b1".into(), "blk", MIB, AccessType::Block, false)
            .await
            .unwrap();
        host.loops.detach(&vol.path).await.unwrap();
        let calls_before = host.loops.detach_calls.load(Ordering::SeqCst);

        factory.delete_volume(&"b1".into()).await.unwrap();
        assert_eq!(host.loops.detach_calls.load(Ordering::SeqCst), calls_before);
        assert!(!vol.path.exists());
    }

    #[tokio::test]
    async fn delete_tolerates_missing_backing_path() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let (factory, registry) = make_factory(tmp.path(), &host);

        let vol = factory
            .create_volume(&"v1".into(), "vol-a", MIB, AccessType::Mount, false)
            .await
            .unwrap();
        std::fs::remove_dir(&vol.path).unwrap();

        factory.delete_volume(&"v1".into()).await.unwrap();
        assert_eq!(registry.volume_count(), 0);
    }
}
