//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the envelope for every request and response exchanged
//! between a [`CsiClient`](crate::transport::client::CsiClient) and the
//! [`CsiServer`](crate::transport::server::CsiServer) running the plugin.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Identity requests ----------------------------------------------
    Probe,
    GetPluginInfo,
    GetPluginCapabilities,

    // ----- Controller requests --------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(VolumeId),
    ControllerPublishVolume {
        volume_id: VolumeId,
        node_id: String,
    },
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    ListVolumes,
    GetCapacity,
    CreateSnapshot(CreateSnapshotRequest),
    DeleteSnapshot(String),
    /// List snapshots, optionally only those of one source volume.
    ListSnapshots(Option<VolumeId>),
    ControllerExpandVolume(ControllerExpandVolumeRequest),

    // ----- Node requests --------------------------------------------------
    StageVolume(NodeStageVolumeRequest),
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    PublishVolume(NodePublishVolumeRequest),
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    NodeExpandVolume(NodeExpandVolumeRequest),
    GetNodeInfo,
    GetNodeCapabilities,
    GetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },

    // ----- Responses ------------------------------------------------------
    VolumeCreated(Volume),
    VolumeList(Vec<Volume>),
    /// Available capacity in bytes.
    Capacity(u64),
    CapabilitiesValid(bool),
    SnapshotCreated(Snapshot),
    SnapshotList(Vec<Snapshot>),
    ControllerExpanded(ControllerExpandVolumeResponse),
    /// Capacity in bytes reported by node expansion.
    NodeExpanded(u64),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    NodeInfoResponse(NodeInfo),
    NodeCapabilitiesResponse(Vec<NodeServiceCapability>),

    /// Generic success acknowledgement (no payload).
    Ok,
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({id})"),
            Self::ControllerPublishVolume { volume_id, node_id } => {
                write!(f, "ControllerPublishVolume({volume_id}, node={node_id})")
            }
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({volume_id})")
            }
            Self::ListVolumes => f.write_str("ListVolumes"),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::CreateSnapshot(req) => write!(
                f,
                "CreateSnapshot(name={}, source={})",
                req.name, req.source_volume_id
            ),
            Self::DeleteSnapshot(id) => write!(f, "DeleteSnapshot({id})"),
            Self::ListSnapshots(Some(id)) => write!(f, "ListSnapshots(source={id})"),
            Self::ListSnapshots(None) => f.write_str("ListSnapshots"),
            Self::ControllerExpandVolume(req) => write!(
                f,
                "ControllerExpandVolume({}, bytes={})",
                req.volume_id, req.capacity_bytes
            ),
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({volume_id})"),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => {
                write!(f, "UnpublishVolume({volume_id})")
            }
            Self::NodeExpandVolume(req) => write!(f, "NodeExpandVolume({})", req.volume_id),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::GetNodeCapabilities => f.write_str("GetNodeCapabilities"),
            Self::GetVolumeStats { volume_id, .. } => write!(f, "GetVolumeStats({volume_id})"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::VolumeList(vs) => write!(f, "VolumeList(count={})", vs.len()),
            Self::Capacity(c) => write!(f, "Capacity({c})"),
            Self::CapabilitiesValid(v) => write!(f, "CapabilitiesValid({v})"),
            Self::SnapshotCreated(s) => write!(f, "SnapshotCreated({})", s.snapshot_id),
            Self::SnapshotList(ss) => write!(f, "SnapshotList(count={})", ss.len()),
            Self::ControllerExpanded(resp) => {
                write!(f, "ControllerExpanded(bytes={})", resp.capacity_bytes)
            }
            Self::NodeExpanded(bytes) => write!(f, "NodeExpanded(bytes={bytes})"),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::Error(e) => write!(f, "Error({}: {e})", e.code()),
        }
    }
}
