//! Core CSI types: volumes, snapshots, capabilities, requests, and topology.
//!
//! These types form the data model shared by the registry, the CSI traits,
//! the transport layer, and the hostpath backend.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::CsiError;

/// Volume context key set by the orchestrator for inline ephemeral volumes.
pub const EPHEMERAL_CONTEXT_KEY: &str = "csi.storage.k8s.io/ephemeral";

/// Publish context key carrying the attached device ID (informational only).
pub const DEVICE_ID_CONTEXT_KEY: &str = "deviceID";

/// Topology segment key advertised by every node.
pub const TOPOLOGY_KEY_NODE: &str = "topology.hostpath.csi/node";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume, assigned by the orchestrator or
/// the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access type, access mode & capabilities
// ---------------------------------------------------------------------------

/// How a volume's backing storage is exposed.  Immutable after creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// A directory on the host, bind-mounted into the workload.
    Mount,
    /// A sparse file attached to a loop device, bind-mounted as a device node.
    Block,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mount => f.write_str("mount"),
            Self::Block => f.write_str("block"),
        }
    }
}

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Single-node read-write.
    #[default]
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Marker for a block access request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BlockVolume {}

/// Mount access request details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MountVolume {
    /// Filesystem type; informational for bind mounts.
    #[serde(default)]
    pub fs_type: String,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

/// Describes the capabilities required from a volume.
///
/// Exactly one of `block` / `mount` should be set; a capability carrying both
/// is rejected by every service that inspects it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeCapability {
    #[serde(default)]
    pub block: Option<BlockVolume>,
    #[serde(default)]
    pub mount: Option<MountVolume>,
    /// Requested access mode.
    #[serde(default)]
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    /// A capability requesting filesystem (directory) access.
    pub fn mount() -> Self {
        Self {
            mount: Some(MountVolume::default()),
            ..Default::default()
        }
    }

    /// A capability requesting raw block access.
    pub fn block() -> Self {
        Self {
            block: Some(BlockVolume::default()),
            ..Default::default()
        }
    }

    /// The access type this capability asks for, or `None` when it names
    /// neither.  Asking for both is an [`CsiError::InvalidArgument`].
    pub fn access_type(&self) -> Result<Option<AccessType>, CsiError> {
        match (&self.block, &self.mount) {
            (Some(_), Some(_)) => Err(CsiError::invalid(
                "cannot have both block and mount access type",
            )),
            (Some(_), None) => Ok(Some(AccessType::Block)),
            (None, Some(_)) => Ok(Some(AccessType::Mount)),
            (None, None) => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Volume & snapshot records
// ---------------------------------------------------------------------------

/// A provisioned hostpath volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Caller-supplied name, unique among live volumes.
    pub name: String,
    /// Provisioned capacity in bytes (bookkeeping only).
    pub size_bytes: u64,
    /// Backing directory or sparse file, `<data_root>/<volume_id>`.
    pub path: PathBuf,
    /// Access type chosen at creation.
    pub access_type: AccessType,
    /// Whether the volume lives only for one publish/unpublish cycle.
    pub ephemeral: bool,
}

/// A point-in-time archive of a mount volume's contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub name: String,
    pub source_volume_id: VolumeId,
    /// Location of the gzip'd tar archive.
    pub path: PathBuf,
    pub creation_time: SystemTime,
    pub size_bytes: u64,
    /// Restores from this snapshot are refused until this is `true`.
    pub ready_to_use: bool,
}

/// Where a new volume's initial contents come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeContentSource {
    /// Extract the archive of the given snapshot ID.
    Snapshot(String),
    /// Copy the contents of the given source volume.
    Volume(VolumeId),
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.hostpath.csi/node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Human-readable name for the volume.
    pub name: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Arbitrary parameters from the storage class.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Optional source of initial contents.
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
}

/// Request to snapshot an existing volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub source_volume_id: VolumeId,
}

/// Request to grow a volume's recorded capacity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: VolumeId,
    pub capacity_bytes: u64,
}

/// Result of a controller-side expansion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: u64,
    pub node_expansion_required: bool,
}

/// Request to stage a volume at a node-global path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging path on the node.
    pub staging_target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a volume at a workload target path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Staging path, if the orchestrator staged the volume first.
    #[serde(default)]
    pub staging_target_path: String,
    /// Target path inside the workload's view of the filesystem.
    pub target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Context returned by controller-publish.
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    /// Context from `CreateVolume` or the inline volume definition.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to expand a published volume on the node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: VolumeId,
    /// Path at which the volume is published or staged.
    pub volume_path: String,
    #[serde(default)]
    pub capacity_bytes: u64,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"hostpath.csi.k8s.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// RPCs the node service supports beyond the mandatory ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeServiceCapability {
    StageUnstageVolume,
    ExpandVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host; `0` means unlimited.
    pub max_volumes: u64,
    /// Topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
