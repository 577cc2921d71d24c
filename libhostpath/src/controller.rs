//! CSI Controller service trait.
//!
//! The Controller service owns the provisioning side of the volume
//! lifecycle: creating and deleting volumes, snapshotting them, recording
//! capacity changes, and answering capability and capacity queries.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse, CreateSnapshotRequest,
    CreateVolumeRequest, Snapshot, Volume, VolumeCapability, VolumeId,
};

/// Controller service: volume and snapshot management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, optionally pre-populated from a snapshot or
    /// another volume.
    ///
    /// Repeating a request whose name is already provisioned with a
    /// compatible size and access type returns the existing volume.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  Unknown IDs succeed.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to a node.  Hostpath volumes are node-local, so this
    /// is not supported.
    async fn controller_publish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List all volumes known to this controller.
    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Return the available capacity of the data root in bytes.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    /// Archive the contents of a mount volume.
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError>;

    /// Delete a snapshot and its archive.  Unknown IDs succeed.
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CsiError>;

    /// List snapshots, optionally only those taken from one volume.
    async fn list_snapshots(
        &self,
        source_volume_id: Option<&VolumeId>,
    ) -> Result<Vec<Snapshot>, CsiError>;

    /// Grow the recorded capacity of a volume.
    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError>;
}
