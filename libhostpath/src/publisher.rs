//! Node-side volume state machine.
//!
//! Per `(volume_id, target_path)` a volume moves
//! `Unpublished → Staged (optional) → Published → Unpublished`.  Staging is a
//! pass-through for hostpath volumes; publishing bind-mounts the volume
//! directory (mount access) or its loop device (block access) onto the
//! target path.
//!
//! Every transition is idempotent so the orchestrator can safely redeliver
//! requests:
//!
//! - publishing onto a target that is already a mount point succeeds without
//!   remounting;
//! - unpublishing a target that is not mounted, or no longer exists,
//!   succeeds;
//! - ephemeral volumes are created on first publish and deleted on
//!   unpublish.
//!
//! Mount and unmount for a volume run under its entry in [`VolumeLocks`].
//! The lock is never held while calling into [`VolumeFactory`], which takes
//! the same lock itself.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::fs::{DirBuilder, OpenOptions};
use tracing::{debug, error, info, instrument};

use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::factory::{VolumeFactory, remove_all};
use crate::host::{HostCapabilities, LoopDeviceManager, Mounter};
use crate::locks::VolumeLocks;
use crate::registry::VolumeRegistry;
use crate::types::*;

pub struct NodePublisher {
    config: Arc<DriverConfig>,
    registry: Arc<VolumeRegistry>,
    factory: Arc<VolumeFactory>,
    locks: Arc<VolumeLocks>,
    loop_devices: Arc<dyn LoopDeviceManager>,
    mounter: Arc<dyn Mounter>,
}

impl NodePublisher {
    pub fn new(
        config: Arc<DriverConfig>,
        registry: Arc<VolumeRegistry>,
        factory: Arc<VolumeFactory>,
        locks: Arc<VolumeLocks>,
        host: &HostCapabilities,
    ) -> Self {
        Self {
            config,
            registry,
            factory,
            locks,
            loop_devices: Arc::clone(&host.loop_devices),
            mounter: Arc::clone(&host.mounter),
        }
    }

    /// Validate a stage request.  Hostpath volumes need no staging step.
    pub fn stage_volume(&self, req: &NodeStageVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing in request"));
        }
        if req.staging_target_path.is_empty() {
            return Err(CsiError::invalid("staging target path missing in request"));
        }
        if req.volume_capability.is_none() {
            return Err(CsiError::invalid("volume capability missing in request"));
        }
        debug!(volume_id = %req.volume_id, "stage is a no-op for hostpath volumes");
        Ok(())
    }

    /// Validate an unstage request.
    pub fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing in request"));
        }
        if staging_target_path.is_empty() {
            return Err(CsiError::invalid("staging target path missing in request"));
        }
        debug!(%volume_id, "unstage is a no-op for hostpath volumes");
        Ok(())
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    pub async fn publish_volume(&self, req: &NodePublishVolumeRequest) -> Result<(), CsiError> {
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| CsiError::invalid("volume capability missing in request"))?;
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing in request"));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::invalid("target path missing in request"));
        }
        let requested = capability.access_type()?.ok_or_else(|| {
            CsiError::invalid("volume capability must request block or mount access")
        })?;

        if self.is_ephemeral(&req.volume_context) {
            self.ensure_ephemeral_volume(&req.volume_id).await?;
        }

        let target = Path::new(&req.target_path);

        let _guard = self.locks.lock(req.volume_id.as_str()).await;
        let volume = self.registry.volume(&req.volume_id)?;
        match requested {
            AccessType::Block => self.publish_block(&volume, target).await,
            AccessType::Mount => self.publish_mount(&volume, target, req).await,
        }
    }

    #[instrument(skip(self))]
    pub async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing in request"));
        }
        if target_path.is_empty() {
            return Err(CsiError::invalid("target path missing in request"));
        }

        let target = Path::new(target_path);

        let volume = {
            let _guard = self.locks.lock(volume_id.as_str()).await;
            let volume = self.registry.volume(volume_id)?;

            if self.mounter.is_mountpoint(target).await? {
                self.mounter.unmount(target).await?;
            }
            // A missing target is fine; repeated calls stay successful.
            remove_all(target).await.map_err(|e| {
                CsiError::Internal(format!("remove target path {target_path}: {e}"))
            })?;
            volume
        };
        info!(%volume_id, %target_path, "volume unpublished");

        if volume.ephemeral {
            debug!(%volume_id, "deleting ephemeral volume");
            match self.factory.delete_volume(volume_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(CsiError::Internal(format!(
                        "failed to delete volume {volume_id}: {e}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Check that the published volume's path matches its access type.
    ///
    /// No filesystem or device growth happens here; the recorded capacity
    /// is returned unchanged.
    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    pub async fn expand_volume(&self, req: &NodeExpandVolumeRequest) -> Result<u64, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID not provided"));
        }
        let volume = self.registry.volume(&req.volume_id)?;

        if req.volume_path.is_empty() {
            return Err(CsiError::invalid("volume path not provided"));
        }
        let meta = tokio::fs::metadata(&req.volume_path).await.map_err(|e| {
            CsiError::invalid(format!(
                "could not get file information from {}: {e}",
                req.volume_path
            ))
        })?;

        let file_type = meta.file_type();
        if file_type.is_dir() {
            if volume.access_type != AccessType::Mount {
                return Err(CsiError::invalid(format!(
                    "volume {} is not a directory",
                    req.volume_id
                )));
            }
        } else if is_device(&file_type) {
            if volume.access_type != AccessType::Block {
                return Err(CsiError::invalid(format!(
                    "volume {} is invalid",
                    req.volume_id
                )));
            }
        } else {
            return Err(CsiError::invalid(format!(
                "volume {} is invalid",
                req.volume_id
            )));
        }

        debug!(path = %req.volume_path, "node expansion is bookkeeping only");
        Ok(volume.size_bytes)
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.config.node_id.clone(),
            max_volumes: self.config.max_volumes_per_node,
            accessible_topology: Some(Topology {
                segments: HashMap::from([(
                    TOPOLOGY_KEY_NODE.to_owned(),
                    self.config.node_id.clone(),
                )]),
            }),
        }
    }

    pub fn capabilities(&self) -> Vec<NodeServiceCapability> {
        vec![
            NodeServiceCapability::StageUnstageVolume,
            NodeServiceCapability::ExpandVolume,
        ]
    }

    /// An explicit `csi.storage.k8s.io/ephemeral` context value wins; when the
    /// key is absent (older orchestrators) the node-wide default applies.
    fn is_ephemeral(&self, volume_context: &HashMap<String, String>) -> bool {
        match volume_context.get(EPHEMERAL_CONTEXT_KEY).map(String::as_str) {
            Some("true") => true,
            None | Some("") => self.config.ephemeral,
            Some(_) => false,
        }
    }

    async fn ensure_ephemeral_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        if self.registry.volume(volume_id).is_ok() {
            return Ok(());
        }
        let name = format!("ephemeral-{volume_id}");
        match self
            .factory
            .create_volume(
                volume_id,
                &name,
                self.config.max_volume_size,
                AccessType::Mount,
                true,
            )
            .await
        {
            Ok(vol) => {
                debug!(path = %vol.path.display(), "ephemeral mode: created volume");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => {
                error!(%volume_id, error = %e, "ephemeral mode failed to create volume");
                Err(CsiError::Internal(e.to_string()))
            }
        }
    }

    async fn publish_block(&self, volume: &Volume, target: &Path) -> Result<(), CsiError> {
        if volume.access_type != AccessType::Block {
            return Err(CsiError::invalid(
                "cannot publish a non-block volume as block volume",
            ));
        }

        let device = self
            .loop_devices
            .lookup(&volume.path)
            .await
            .map_err(|e| CsiError::Internal(format!("failed to get the loop device: {e}")))?;

        ensure_file(target).await.map_err(|e| {
            CsiError::Internal(format!(
                "failed to create target path {}: {e}",
                target.display()
            ))
        })?;

        if self.mounter.is_mountpoint(target).await? {
            debug!("target already mounted, assuming idempotent retry");
            return Ok(());
        }

        self.mounter
            .bind_mount(&device, target, false)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "failed to mount block device {} at {}: {e}",
                    device.display(),
                    target.display()
                ))
            })?;

        info!(device = %device.display(), "block volume published (bind-mount)");
        Ok(())
    }

    async fn publish_mount(
        &self,
        volume: &Volume,
        target: &Path,
        req: &NodePublishVolumeRequest,
    ) -> Result<(), CsiError> {
        if volume.access_type != AccessType::Mount {
            return Err(CsiError::invalid(
                "cannot publish a non-mount volume as mount volume",
            ));
        }

        DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(target)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "failed to create target path {}: {e}",
                    target.display()
                ))
            })?;

        if self.mounter.is_mountpoint(target).await? {
            debug!("target already mounted, assuming idempotent retry");
            return Ok(());
        }

        // A failed mount of an ephemeral volume removes its directory while
        // the record stays registered for the retry.
        if volume.ephemeral {
            DirBuilder::new()
                .recursive(true)
                .mode(0o777)
                .create(&volume.path)
                .await
                .map_err(|e| {
                    CsiError::Internal(format!(
                        "failed to create ephemeral volume directory {}: {e}",
                        volume.path.display()
                    ))
                })?;
        }

        let mount = req
            .volume_capability
            .as_ref()
            .and_then(|cap| cap.mount.as_ref());
        debug!(
            read_only = req.read_only,
            fs_type = mount.map(|m| m.fs_type.as_str()).unwrap_or_default(),
            mount_flags = ?mount.map(|m| &m.mount_flags),
            device_id = req.publish_context.get(DEVICE_ID_CONTEXT_KEY).map(String::as_str).unwrap_or_default(),
            attributes = ?req.volume_context,
            "bind-mounting volume directory",
        );

        if let Err(e) = self
            .mounter
            .bind_mount(&volume.path, target, req.read_only)
            .await
        {
            let mut reason = e.to_string();
            if volume.ephemeral
                && let Err(rm) = remove_all(&volume.path).await
            {
                reason.push_str(&format!(": {rm}"));
            }
            return Err(CsiError::Internal(format!(
                "failed to mount {} at {}: {reason}",
                volume.path.display(),
                target.display()
            )));
        }

        info!(read_only = req.read_only, "volume published (bind-mount)");
        Ok(())
    }
}

fn is_device(file_type: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_block_device() || file_type.is_char_device()
}

/// Make sure `path` exists, creating an empty regular file when it does not.
async fn ensure_file(path: &Path) -> io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .await
            .map(drop),
        Err(e) => Err(e),
    }
}
