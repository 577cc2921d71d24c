//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes volumes visible to
//! workloads:
//!
//! 1. **Stage**: validate the request; hostpath volumes need no global mount.
//! 2. **Publish**: bind-mount the volume directory or loop device onto the
//!    target path, creating ephemeral volumes on demand.
//! 3. **Unpublish**: remove the bind mount and the target path, deleting
//!    ephemeral volumes.
//! 4. **Unstage**: validate the request.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeExpandVolumeRequest, NodeInfo, NodePublishVolumeRequest, NodeServiceCapability,
    NodeStageVolumeRequest, VolumeId,
};

/// Node service: local mount and unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume at `target_path`.
    ///
    /// This is idempotent: calling it again for the same `target_path`
    /// succeeds without mounting twice.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from `target_path`.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Validate a published volume path against the volume's access type and
    /// return its capacity in bytes.
    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<u64, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<NodeServiceCapability>, CsiError>;

    /// Volume usage statistics are not reported by this driver.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<(), CsiError>;
}
