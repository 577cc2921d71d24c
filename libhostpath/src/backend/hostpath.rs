//! Hostpath storage backend for CSI.
//!
//! [`HostPathBackend`] implements [`CsiIdentity`], [`CsiController`], and
//! [`CsiNode`] on top of a single local data root.  Volumes are plain
//! directories (mount access) or sparse files attached to loop devices
//! (block access); snapshots are gzip'd tarballs of mount volumes.
//!
//! # On-disk layout
//!
//! ```text
//! <data_root>/
//!   <volume-id>             # directory or sparse block file
//!   <snapshot-id>.tgz       # snapshot archive
//! ```
//!
//! State lives only in memory; nothing is persisted next to the data.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs::DirBuilder;
use tracing::{debug, info, instrument, warn};

use crate::cloner::ContentCloner;
use crate::config::DriverConfig;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::factory::{VolumeFactory, remove_all};
use crate::host::HostCapabilities;
use crate::identity::CsiIdentity;
use crate::locks::VolumeLocks;
use crate::node::CsiNode;
use crate::publisher::NodePublisher;
use crate::registry::VolumeRegistry;
use crate::types::*;

/// Concrete CSI backend storing volumes under a local directory.
///
/// # Thread safety
///
/// The registry is guarded by a read/write lock and every operation that
/// touches a volume's backing storage or mounts takes that volume's entry in
/// [`VolumeLocks`], so different volumes proceed concurrently.
pub struct HostPathBackend {
    config: Arc<DriverConfig>,
    registry: Arc<VolumeRegistry>,
    locks: Arc<VolumeLocks>,
    factory: Arc<VolumeFactory>,
    cloner: ContentCloner,
    publisher: NodePublisher,
}

impl HostPathBackend {
    /// Create a backend bound to the real host tools.
    pub fn new(config: DriverConfig) -> Result<Self, CsiError> {
        Self::with_capabilities(config, HostCapabilities::system())
    }

    /// Create a backend using the given host primitives.
    pub fn with_capabilities(
        config: DriverConfig,
        host: HostCapabilities,
    ) -> Result<Self, CsiError> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(VolumeRegistry::new());
        let locks = Arc::new(VolumeLocks::new());
        let factory = Arc::new(VolumeFactory::new(
            config.data_root.clone(),
            Arc::clone(&registry),
            Arc::clone(&locks),
            &host,
        ));
        let cloner = ContentCloner::new(Arc::clone(&registry), &host);
        let publisher = NodePublisher::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&factory),
            Arc::clone(&locks),
            &host,
        );
        Ok(Self {
            config,
            registry,
            locks,
            factory,
            cloner,
            publisher,
        })
    }

    /// Create the data root if it does not exist yet.
    pub async fn init(&self) -> Result<(), CsiError> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(&self.config.data_root)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "failed to create data root {}: {e}",
                    self.config.data_root.display()
                ))
            })?;
        info!(
            driver = %self.config.driver_name,
            node_id = %self.config.node_id,
            data_root = %self.config.data_root.display(),
            "hostpath backend initialized",
        );
        Ok(())
    }

    fn snapshot_path(&self, snapshot_id: &str) -> std::path::PathBuf {
        self.config.data_root.join(format!("{snapshot_id}.tgz"))
    }

    async fn populate(
        &self,
        source: &VolumeContentSource,
        dest: &Path,
    ) -> Result<(), CsiError> {
        match source {
            VolumeContentSource::Snapshot(snapshot_id) => {
                self.cloner.populate_from_snapshot(snapshot_id, dest).await
            }
            VolumeContentSource::Volume(volume_id) => {
                self.cloner.populate_from_volume(volume_id, dest).await
            }
        }
    }
}

/// The single access type requested by a set of capabilities.  Capabilities
/// that name neither default to mount access.
fn requested_access_type(capabilities: &[VolumeCapability]) -> Result<AccessType, CsiError> {
    let mut block = false;
    let mut mount = false;
    for cap in capabilities {
        match cap.access_type()? {
            Some(AccessType::Block) => block = true,
            Some(AccessType::Mount) => mount = true,
            None => {}
        }
    }
    if block && mount {
        return Err(CsiError::invalid(
            "cannot have both block and mount access type",
        ));
    }
    Ok(if block {
        AccessType::Block
    } else {
        AccessType::Mount
    })
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for HostPathBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.driver_name.clone(),
            vendor_version: self.config.vendor_version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        let healthy = tokio::fs::metadata(&self.config.data_root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok(healthy)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeAccessibilityConstraints,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for HostPathBackend {
    #[instrument(skip(self), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::invalid("name missing in request"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid("volume capabilities missing in request"));
        }
        let access_type = requested_access_type(&req.volume_capabilities)?;

        if req.capacity_bytes > self.config.max_volume_size {
            return Err(CsiError::OutOfRange(format!(
                "requested capacity {} exceeds maximum allowed {}",
                req.capacity_bytes, self.config.max_volume_size
            )));
        }

        // Serialize creates of the same name so retries observe each other.
        let _guard = self.locks.lock(&format!("volume-name:{}", req.name)).await;

        if let Ok(existing) = self.registry.volume_by_name(&req.name) {
            if existing.size_bytes < req.capacity_bytes {
                return Err(CsiError::VolumeAlreadyExists(format!(
                    "{} with the same name but a smaller size",
                    existing.volume_id
                )));
            }
            if existing.access_type != access_type {
                return Err(CsiError::VolumeAlreadyExists(format!(
                    "{} with the same name but {} access",
                    existing.volume_id, existing.access_type
                )));
            }
            debug!(volume_id = %existing.volume_id, "returning existing volume for idempotent create");
            return Ok(existing);
        }

        if access_type == AccessType::Block && req.content_source.is_some() {
            return Err(CsiError::invalid(
                "content source is only supported for mount volumes",
            ));
        }

        let volume_id = VolumeId(uuid::Uuid::new_v4().to_string());
        let volume = self
            .factory
            .create_volume(&volume_id, &req.name, req.capacity_bytes, access_type, false)
            .await?;

        if let Some(source) = &req.content_source
            && let Err(e) = self.populate(source, &volume.path).await
        {
            if let Err(cleanup) = self.factory.delete_volume(&volume_id).await {
                warn!(%volume_id, error = %cleanup, "failed to delete volume after population error");
            }
            return Err(e);
        }

        info!(%volume_id, %access_type, "volume provisioned");
        Ok(volume)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing in request"));
        }
        self.factory.delete_volume(volume_id).await
    }

    async fn controller_publish_volume(
        &self,
        _volume_id: &VolumeId,
        _node_id: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("ControllerPublishVolume".into()))
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing in request"));
        }
        let volume = self.registry.volume(volume_id)?;
        for cap in capabilities {
            if let Some(requested) = cap.access_type()?
                && requested != volume.access_type
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        let mut volumes = self.registry.list_volumes();
        volumes.sort_by(|a, b| a.volume_id.0.cmp(&b.volume_id.0));
        Ok(volumes)
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        let stat = nix::sys::statvfs::statvfs(self.config.data_root.as_path())
            .map_err(|e| CsiError::Internal(format!("statvfs: {e}")))?;
        Ok(stat.fragment_size() * stat.blocks_available())
    }

    #[instrument(skip(self), fields(name = %req.name, source = %req.source_volume_id))]
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::invalid("name missing in request"));
        }
        if req.source_volume_id.is_empty() {
            return Err(CsiError::invalid("source volume ID missing in request"));
        }

        let _guard = self.locks.lock(&format!("snapshot:{}", req.name)).await;

        if let Ok(existing) = self.registry.snapshot_by_name(&req.name) {
            if existing.source_volume_id == req.source_volume_id {
                debug!(snapshot_id = %existing.snapshot_id, "returning existing snapshot");
                return Ok(existing);
            }
            return Err(CsiError::SnapshotAlreadyExists(format!(
                "{} for a different source volume",
                req.name
            )));
        }

        let volume = self.registry.volume(&req.source_volume_id)?;
        if volume.access_type != AccessType::Mount {
            return Err(CsiError::invalid(format!(
                "cannot snapshot volume {}: only mount volumes are supported",
                volume.volume_id
            )));
        }

        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let path = self.snapshot_path(&snapshot_id);
        if let Err(e) = self.cloner.archive_volume(&volume, &path).await {
            if let Err(rm) = remove_all(&path).await {
                warn!(path = %path.display(), error = %rm, "failed to remove partial archive");
            }
            return Err(CsiError::Internal(format!(
                "failed to create snapshot {}: {e}",
                req.name
            )));
        }

        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|e| CsiError::Internal(format!("stat {}: {e}", path.display())))?
            .len();

        let snapshot = Snapshot {
            snapshot_id: snapshot_id.clone(),
            name: req.name,
            source_volume_id: req.source_volume_id,
            path,
            creation_time: SystemTime::now(),
            size_bytes,
            ready_to_use: true,
        };
        self.registry.create_snapshot(snapshot.clone())?;

        info!(%snapshot_id, size_bytes, "snapshot created");
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CsiError> {
        if snapshot_id.is_empty() {
            return Err(CsiError::invalid("snapshot ID missing in request"));
        }

        let snapshot = match self.registry.snapshot(snapshot_id) {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                debug!("snapshot not registered, nothing to delete");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        remove_all(&snapshot.path).await.map_err(|e| {
            CsiError::Internal(format!("remove {}: {e}", snapshot.path.display()))
        })?;
        self.registry.delete_snapshot(snapshot_id);

        info!("snapshot deleted");
        Ok(())
    }

    async fn list_snapshots(
        &self,
        source_volume_id: Option<&VolumeId>,
    ) -> Result<Vec<Snapshot>, CsiError> {
        let mut snapshots: Vec<Snapshot> = self
            .registry
            .list_snapshots()
            .into_iter()
            .filter(|s| source_volume_id.is_none_or(|id| &s.source_volume_id == id))
            .collect();
        snapshots.sort_by(|a, b| a.creation_time.cmp(&b.creation_time));
        Ok(snapshots)
    }

    #[instrument(skip(self), fields(volume_id = %req.volume_id))]
    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume ID missing in request"));
        }
        if req.capacity_bytes > self.config.max_volume_size {
            return Err(CsiError::OutOfRange(format!(
                "requested capacity {} exceeds maximum allowed {}",
                req.capacity_bytes, self.config.max_volume_size
            )));
        }

        let _guard = self.locks.lock(req.volume_id.as_str()).await;
        let mut volume = self.registry.volume(&req.volume_id)?;
        if req.capacity_bytes > volume.size_bytes {
            volume.size_bytes = req.capacity_bytes;
            self.registry.update_volume(volume.clone())?;
            info!(size_bytes = volume.size_bytes, "volume capacity expanded");
        }

        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: volume.size_bytes,
            node_expansion_required: true,
        })
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for HostPathBackend {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.publisher.stage_volume(&req)
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.publisher
            .unstage_volume(volume_id, staging_target_path)
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.publisher.publish_volume(&req).await
    }

    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.publisher
            .unpublish_volume(volume_id, target_path)
            .await
    }

    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<u64, CsiError> {
        self.publisher.expand_volume(&req).await
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(self.publisher.node_info())
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeServiceCapability>, CsiError> {
        Ok(self.publisher.capabilities())
    }

    async fn get_volume_stats(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodeGetVolumeStats".into()))
    }
}
