//! QUIC server that runs alongside the plugin on each node and dispatches
//! incoming CSI requests to the backend's trait implementations.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;
use crate::transport::MAX_MESSAGE_SIZE;

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to an [`CsiIdentity`] + [`CsiController`] +
/// [`CsiNode`] implementation.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Create a new server bound to `addr`.
    ///
    /// `tls_config` is built from the certificate and key handed to the
    /// plugin binary.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self { endpoint, handler })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(conn: quinn::Connection, handler: Arc<T>) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
    ) -> Result<(), CsiError> {
        // Read the full request.
        let buf = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(CsiError::transport)?;

        let request: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::TransportError(format!("malformed request: {e}")))?;

        debug!(%request, "CSI request received");

        let response = Self::dispatch(handler, request).await;

        // Serialize and send the response.
        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Map a [`CsiMessage`] request to the correct trait method call and
    /// wrap the result in a response [`CsiMessage`].
    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        let response = match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => handler.probe().await.map(CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => handler
                .get_plugin_info()
                .await
                .map(CsiMessage::PluginInfoResponse),
            CsiMessage::GetPluginCapabilities => handler
                .get_plugin_capabilities()
                .await
                .map(CsiMessage::PluginCapabilitiesResponse),

            // --- Controller -------------------------------------------------
            CsiMessage::CreateVolume(req) => handler
                .create_volume(req)
                .await
                .map(CsiMessage::VolumeCreated),
            CsiMessage::DeleteVolume(id) => handler.delete_volume(&id).await.map(|()| CsiMessage::Ok),
            CsiMessage::ControllerPublishVolume { volume_id, node_id } => handler
                .controller_publish_volume(&volume_id, &node_id)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::ValidateVolumeCapabilities {
                volume_id,
                capabilities,
            } => handler
                .validate_volume_capabilities(&volume_id, &capabilities)
                .await
                .map(CsiMessage::CapabilitiesValid),
            CsiMessage::ListVolumes => handler.list_volumes().await.map(CsiMessage::VolumeList),
            CsiMessage::GetCapacity => handler.get_capacity().await.map(CsiMessage::Capacity),
            CsiMessage::CreateSnapshot(req) => handler
                .create_snapshot(req)
                .await
                .map(CsiMessage::SnapshotCreated),
            CsiMessage::DeleteSnapshot(id) => handler
                .delete_snapshot(&id)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::ListSnapshots(source) => handler
                .list_snapshots(source.as_ref())
                .await
                .map(CsiMessage::SnapshotList),
            CsiMessage::ControllerExpandVolume(req) => handler
                .controller_expand_volume(req)
                .await
                .map(CsiMessage::ControllerExpanded),

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => handler.stage_volume(req).await.map(|()| CsiMessage::Ok),
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => handler
                .unstage_volume(&volume_id, &staging_target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::PublishVolume(req) => {
                handler.publish_volume(req).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => handler
                .unpublish_volume(&volume_id, &target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::NodeExpandVolume(req) => handler
                .expand_volume(req)
                .await
                .map(CsiMessage::NodeExpanded),
            CsiMessage::GetNodeInfo => handler.get_info().await.map(CsiMessage::NodeInfoResponse),
            CsiMessage::GetNodeCapabilities => handler
                .get_capabilities()
                .await
                .map(CsiMessage::NodeCapabilitiesResponse),
            CsiMessage::GetVolumeStats {
                volume_id,
                volume_path,
            } => handler
                .get_volume_stats(&volume_id, &volume_path)
                .await
                .map(|()| CsiMessage::Ok),

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                Err(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        };

        response.unwrap_or_else(|e| {
            debug!(code = %e.code(), error = %e, "CSI request failed");
            CsiMessage::Error(e)
        })
    }

    /// Stop accepting connections and close the open ones.  [`Self::serve`]
    /// returns once the endpoint is closed.
    pub fn close(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutdown");
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address or shutting down.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostPathBackend;
    use crate::config::{DriverConfig, MIB};
    use crate::error::StatusCode;
    use crate::testing::FakeHost;
    use crate::types::*;

    async fn backend(root: &std::path::Path) -> HostPathBackend {
        let config = DriverConfig {
            node_id: "node-1".into(),
            data_root: root.join("data"),
            ..Default::default()
        };
        let backend =
            HostPathBackend::with_capabilities(config, FakeHost::new().capabilities()).unwrap();
        backend.init().await.unwrap();
        backend
    }

    async fn dispatch(handler: &HostPathBackend, msg: CsiMessage) -> CsiMessage {
        CsiServer::<HostPathBackend>::dispatch(handler, msg).await
    }

    #[tokio::test]
    async fn dispatches_identity_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = backend(tmp.path()).await;

        assert!(matches!(
            dispatch(&handler, CsiMessage::Probe).await,
            CsiMessage::ProbeResult(true)
        ));
        match dispatch(&handler, CsiMessage::GetPluginInfo).await {
            CsiMessage::PluginInfoResponse(info) => assert_eq!(info.name, "hostpath.csi.k8s.io"),
            other => panic!("unexpected response: {other}"),
        }
    }

    #[tokio::test]
    async fn dispatches_volume_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = backend(tmp.path()).await;

        let created = dispatch(
            &handler,
            CsiMessage::CreateVolume(CreateVolumeRequest {
                name: "vol-a".into(),
                capacity_bytes: MIB,
                volume_capabilities: vec![VolumeCapability::mount()],
                ..Default::default()
            }),
        )
        .await;
        let CsiMessage::VolumeCreated(volume) = created else {
            panic!("unexpected response: {created}");
        };

        match dispatch(&handler, CsiMessage::ListVolumes).await {
            CsiMessage::VolumeList(vols) => assert_eq!(vols, vec![volume.clone()]),
            other => panic!("unexpected response: {other}"),
        }

        assert!(matches!(
            dispatch(&handler, CsiMessage::DeleteVolume(volume.volume_id)).await,
            CsiMessage::Ok
        ));
    }

    #[tokio::test]
    async fn failures_travel_as_error_messages() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = backend(tmp.path()).await;

        match dispatch(
            &handler,
            CsiMessage::UnpublishVolume {
                volume_id: "ghost".into(),
                target_path: "/tmp/target".into(),
            },
        )
        .await
        {
            CsiMessage::Error(e) => assert_eq!(e.code(), StatusCode::NotFound),
            other => panic!("unexpected response: {other}"),
        }

        match dispatch(&handler, CsiMessage::Capacity(1)).await {
            CsiMessage::Error(e) => assert_eq!(e.code(), StatusCode::InvalidArgument),
            other => panic!("unexpected response: {other}"),
        }
    }
}
