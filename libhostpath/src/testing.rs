//! In-memory host capabilities for unit tests.
//!
//! The fakes keep loop bindings and mounts in maps so the factory and the
//! node publisher can be driven through full lifecycles without root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::CsiError;
use crate::host::{Archiver, Copier, HostCapabilities, LoopDeviceManager, Mounter, SpaceAllocator};

/// Holds the next call of a fake operation until the test opens it, so a
/// competing request can be started while the first one is in flight.
#[derive(Default)]
pub struct Gate {
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl Gate {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until an armed call has stopped at the gate.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn open(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }
}

#[derive(Default)]
pub struct FakeLoopDevices {
    bindings: Mutex<HashMap<PathBuf, PathBuf>>,
    next: AtomicUsize,
    pub fail_attach: AtomicBool,
    pub attach_calls: AtomicUsize,
    pub detach_calls: AtomicUsize,
    pub attach_gate: Gate,
}

impl FakeLoopDevices {
    pub fn bound(&self, backing_file: &Path) -> Option<PathBuf> {
        self.bindings.lock().get(backing_file).cloned()
    }

    pub fn count(&self) -> usize {
        self.bindings.lock().len()
    }
}

#[async_trait]
impl LoopDeviceManager for FakeLoopDevices {
    async fn attach(&self, backing_file: &Path) -> Result<PathBuf, CsiError> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        self.attach_gate.pass().await;
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(CsiError::ToolFailed {
                command: format!("losetup -f --show {}", backing_file.display()),
                output: "losetup: cannot find an unused loop device".into(),
            });
        }
        let device = PathBuf::from(format!(
            "/dev/loop{}",
            self.next.fetch_add(1, Ordering::SeqCst)
        ));
        self.bindings
            .lock()
            .insert(backing_file.to_path_buf(), device.clone());
        Ok(device)
    }

    async fn detach(&self, device_or_file: &Path) -> Result<(), CsiError> {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
        self.bindings
            .lock()
            .retain(|file, dev| file != device_or_file && dev != device_or_file);
        Ok(())
    }

    async fn lookup(&self, backing_file: &Path) -> Result<PathBuf, CsiError> {
        self.bound(backing_file)
            .ok_or_else(|| CsiError::LoopDeviceNotFound(backing_file.display().to_string()))
    }
}

/// A recorded bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMount {
    pub source: PathBuf,
    pub read_only: bool,
}

#[derive(Default)]
pub struct FakeMounter {
    mounts: Mutex<HashMap<PathBuf, FakeMount>>,
    pub fail_mount: AtomicBool,
    pub mount_calls: AtomicUsize,
    pub mount_gate: Gate,
}

impl FakeMounter {
    pub fn mount_at(&self, target: &Path) -> Option<FakeMount> {
        self.mounts.lock().get(target).cloned()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        self.mount_gate.pass().await;
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(CsiError::MountFailed {
                path: target.display().to_string(),
                reason: "operation not permitted".into(),
            });
        }
        self.mounts.lock().insert(
            target.to_path_buf(),
            FakeMount {
                source: source.to_path_buf(),
                read_only,
            },
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        self.mounts.lock().remove(target);
        Ok(())
    }

    async fn is_mountpoint(&self, path: &Path) -> Result<bool, CsiError> {
        Ok(self.mounts.lock().contains_key(path))
    }
}

/// Archiver that writes a marker instead of a real tarball.
#[derive(Default)]
pub struct FakeArchiver {
    pub fail: AtomicBool,
}

pub const RESTORED_MARKER: &str = "restored-from-snapshot";

#[async_trait]
impl Archiver for FakeArchiver {
    async fn create(&self, source_dir: &Path, archive: &Path) -> Result<(), CsiError> {
        std::fs::write(archive, source_dir.display().to_string()).map_err(CsiError::internal)
    }

    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<(), CsiError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CsiError::ToolFailed {
                command: format!("tar zxvf {}", archive.display()),
                output: "gzip: stdin: not in gzip format".into(),
            });
        }
        std::fs::write(dest_dir.join(RESTORED_MARKER), archive.display().to_string())
            .map_err(CsiError::internal)
    }
}

/// Copier that copies the top-level files of a directory.
#[derive(Default)]
pub struct FakeCopier {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Copier for FakeCopier {
    async fn copy_tree(&self, source_dir: &Path, dest_dir: &Path) -> Result<(), CsiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for entry in std::fs::read_dir(source_dir).map_err(CsiError::internal)? {
            let entry = entry.map_err(CsiError::internal)?;
            std::fs::copy(entry.path(), dest_dir.join(entry.file_name()))
                .map_err(CsiError::internal)?;
        }
        Ok(())
    }
}

/// Allocator creating a sparse file with `set_len`.
#[derive(Default)]
pub struct FakeAllocator {
    pub last_size: AtomicUsize,
}

#[async_trait]
impl SpaceAllocator for FakeAllocator {
    async fn allocate(&self, path: &Path, size_bytes: u64) -> Result<(), CsiError> {
        let file = std::fs::File::create(path).map_err(CsiError::internal)?;
        file.set_len(size_bytes).map_err(CsiError::internal)?;
        self.last_size.store(size_bytes as usize, Ordering::SeqCst);
        Ok(())
    }
}

/// Handles to every fake, plus the [`HostCapabilities`] wrapping them.
pub struct FakeHost {
    pub loops: Arc<FakeLoopDevices>,
    pub mounter: Arc<FakeMounter>,
    pub archiver: Arc<FakeArchiver>,
    pub copier: Arc<FakeCopier>,
    pub allocator: Arc<FakeAllocator>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            loops: Arc::default(),
            mounter: Arc::default(),
            archiver: Arc::default(),
            copier: Arc::default(),
            allocator: Arc::default(),
        }
    }

    pub fn capabilities(&self) -> HostCapabilities {
        HostCapabilities {
            loop_devices: self.loops.clone(),
            mounter: self.mounter.clone(),
            archiver: self.archiver.clone(),
            copier: self.copier.clone(),
            allocator: self.allocator.clone(),
        }
    }
}
