//! Pre-populating new volumes from snapshots or other volumes.
//!
//! Population runs once per destination at provisioning time and always to
//! completion; there is no cancellation once the host tool is running.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::error::CsiError;
use crate::host::{Archiver, Copier, HostCapabilities};
use crate::registry::VolumeRegistry;
use crate::types::{Volume, VolumeId};

pub struct ContentCloner {
    registry: Arc<VolumeRegistry>,
    archiver: Arc<dyn Archiver>,
    copier: Arc<dyn Copier>,
}

impl ContentCloner {
    pub fn new(registry: Arc<VolumeRegistry>, host: &HostCapabilities) -> Self {
        Self {
            registry,
            archiver: Arc::clone(&host.archiver),
            copier: Arc::clone(&host.copier),
        }
    }

    /// Extract the archive of `snapshot_id` into `dest`.
    ///
    /// Fails with [`CsiError::FailedPrecondition`] while the snapshot is not
    /// ready to use.
    #[instrument(skip(self), fields(dest = %dest.display()))]
    pub async fn populate_from_snapshot(
        &self,
        snapshot_id: &str,
        dest: &Path,
    ) -> Result<(), CsiError> {
        let snapshot = self.registry.snapshot(snapshot_id)?;
        if !snapshot.ready_to_use {
            return Err(CsiError::FailedPrecondition(format!(
                "snapshot {snapshot_id} is not yet ready to use"
            )));
        }

        self.archiver
            .extract(&snapshot.path, dest)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "failed to pre-populate data from snapshot {snapshot_id}: {e}"
                ))
            })?;
        info!(%snapshot_id, "volume populated from snapshot");
        Ok(())
    }

    /// Copy the contents of `source_volume_id` into `dest`.  An empty source
    /// leaves `dest` untouched.
    #[instrument(skip(self), fields(source = %source_volume_id, dest = %dest.display()))]
    pub async fn populate_from_volume(
        &self,
        source_volume_id: &VolumeId,
        dest: &Path,
    ) -> Result<(), CsiError> {
        let source = self.registry.volume(source_volume_id).map_err(|_| {
            CsiError::VolumeNotFound(format!(
                "{source_volume_id}: source volume does not exist, are source and destination in the same storage class?"
            ))
        })?;

        let empty = is_empty_dir(&source.path).await.map_err(|e| {
            CsiError::Internal(format!(
                "failed verification check of source volume {source_volume_id}: {e}"
            ))
        })?;
        if empty {
            debug!("source volume is empty, nothing to copy");
            return Ok(());
        }

        self.copier
            .copy_tree(&source.path, dest)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "failed to pre-populate data from volume {source_volume_id}: {e}"
                ))
            })?;
        info!("volume populated from source volume");
        Ok(())
    }

    /// Archive the contents of a mount volume to `archive`.
    pub async fn archive_volume(&self, volume: &Volume, archive: &Path) -> Result<(), CsiError> {
        self.archiver.create(&volume.path, archive).await
    }
}

async fn is_empty_dir(path: &Path) -> std::io::Result<bool> {
    let mut entries = tokio::fs::read_dir(path).await?;
    Ok(entries.next_entry().await?.is_none())
}
