//! Client side of the plugin's QUIC endpoint.
//!
//! [`CsiClient`] is what a container orchestrator (or a test) holds to drive
//! a running hostpath plugin.  Besides the raw [`CsiClient::request`] it
//! offers typed calls for the verbs a workload lifecycle walks through:
//! create, publish, unpublish and delete of volumes plus snapshotting.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use crate::error::CsiError;
use crate::message::CsiMessage;
use crate::transport::MAX_MESSAGE_SIZE;
use crate::types::{
    CreateSnapshotRequest, CreateVolumeRequest, NodeInfo, NodePublishVolumeRequest, PluginInfo,
    Snapshot, Volume, VolumeId,
};

/// One QUIC connection to a hostpath plugin.  Every request travels on its
/// own bi-directional stream, so a client may be shared between tasks.
pub struct CsiClient {
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
}

impl CsiClient {
    /// Connect to the plugin listening on `addr`.  `server_name` is checked
    /// against the SANs of the plugin certificate, which must chain to a root
    /// in `tls_config`.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let crypto = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("client TLS config unusable for QUIC: {e}")))?;

        let local: SocketAddr = if addr.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = quinn::Endpoint::client(local).map_err(CsiError::transport)?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

        let connecting = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?;
        let connection = connecting.await.map_err(|e| {
            CsiError::TransportError(format!("connecting to plugin at {addr}: {e}"))
        })?;

        debug!(%addr, %server_name, "connected to hostpath plugin");
        Ok(Self {
            endpoint,
            connection,
        })
    }

    /// Send `msg` and return whatever the plugin replied, including
    /// [`CsiMessage::Error`].
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::transport)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;

        let reply = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(CsiError::transport)?;
        let reply: CsiMessage = serde_json::from_slice(&reply).map_err(|e| {
            CsiError::TransportError(format!("malformed reply to {msg}: {e}"))
        })?;
        debug!(%reply, "plugin replied");
        Ok(reply)
    }

    /// Like [`Self::request`], but a [`CsiMessage::Error`] reply becomes `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        match self.request(msg).await? {
            CsiMessage::Error(e) => Err(e),
            other => Ok(other),
        }
    }

    pub async fn probe(&self) -> Result<bool, CsiError> {
        let request = CsiMessage::Probe;
        match self.call(&request).await? {
            CsiMessage::ProbeResult(ready) => Ok(ready),
            other => Err(unexpected(&request, other)),
        }
    }

    pub async fn plugin_info(&self) -> Result<PluginInfo, CsiError> {
        let request = CsiMessage::GetPluginInfo;
        match self.call(&request).await? {
            CsiMessage::PluginInfoResponse(info) => Ok(info),
            other => Err(unexpected(&request, other)),
        }
    }

    pub async fn node_info(&self) -> Result<NodeInfo, CsiError> {
        let request = CsiMessage::GetNodeInfo;
        match self.call(&request).await? {
            CsiMessage::NodeInfoResponse(info) => Ok(info),
            other => Err(unexpected(&request, other)),
        }
    }

    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        let request = CsiMessage::CreateVolume(req);
        match self.call(&request).await? {
            CsiMessage::VolumeCreated(volume) => Ok(volume),
            other => Err(unexpected(&request, other)),
        }
    }

    pub async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.expect_ok(CsiMessage::DeleteVolume(volume_id.clone()))
            .await
    }

    pub async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        let request = CsiMessage::CreateSnapshot(req);
        match self.call(&request).await? {
            CsiMessage::SnapshotCreated(snapshot) => Ok(snapshot),
            other => Err(unexpected(&request, other)),
        }
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CsiError> {
        self.expect_ok(CsiMessage::DeleteSnapshot(snapshot_id.to_owned()))
            .await
    }

    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.expect_ok(CsiMessage::PublishVolume(req)).await
    }

    pub async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.expect_ok(CsiMessage::UnpublishVolume {
            volume_id: volume_id.clone(),
            target_path: target_path.to_owned(),
        })
        .await
    }

    async fn expect_ok(&self, request: CsiMessage) -> Result<(), CsiError> {
        match self.call(&request).await? {
            CsiMessage::Ok => Ok(()),
            other => Err(unexpected(&request, other)),
        }
    }

    /// Close the connection and the local endpoint.  Requests still in
    /// flight fail with a transport error.
    pub fn close(&self) {
        let reason = b"client closed";
        self.connection.close(quinn::VarInt::from_u32(0), reason);
        self.endpoint.close(quinn::VarInt::from_u32(0), reason);
    }
}

fn unexpected(request: &CsiMessage, reply: CsiMessage) -> CsiError {
    CsiError::TransportError(format!("unexpected reply {reply} to {request}"))
}
