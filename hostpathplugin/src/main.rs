use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libhostpath::transport::server::CsiServer;
use libhostpath::{DriverConfig, HostPathBackend};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostpathplugin")]
#[command(about = "Hostpath CSI driver serving CSI requests over QUIC", long_about = None)]
struct Args {
    /// Address the QUIC endpoint listens on.
    #[arg(long, env = "HOSTPATH_ENDPOINT", default_value = "0.0.0.0:10000")]
    endpoint: SocketAddr,

    /// Name of the driver.
    #[arg(long = "drivername", env = "HOSTPATH_DRIVER_NAME", default_value = libhostpath::config::DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Node id.
    #[arg(long = "nodeid", env = "HOSTPATH_NODE_ID", default_value = "")]
    node_id: String,

    /// Publish volumes in ephemeral mode even if the orchestrator did not
    /// ask for it (only needed for very old orchestrators).
    #[arg(long, env = "HOSTPATH_EPHEMERAL")]
    ephemeral: bool,

    /// Limit of volumes per node; 0 means unlimited.
    #[arg(long = "maxvolumespernode", env = "HOSTPATH_MAX_VOLUMES_PER_NODE", default_value_t = 0)]
    max_volumes_per_node: u64,

    /// Directory holding volume data and snapshot archives.
    #[arg(long, env = "HOSTPATH_DATA_ROOT", default_value = libhostpath::config::DEFAULT_DATA_ROOT)]
    data_root: PathBuf,

    /// PEM certificate chain for the QUIC endpoint.  A self-signed
    /// certificate is generated when omitted.
    #[arg(long, env = "HOSTPATH_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key matching `--tls-cert`.
    #[arg(long, env = "HOSTPATH_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Print the driver version and exit.
    #[arg(long)]
    version: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if args.version {
        println!("{} {}", args.driver_name, env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.ephemeral {
        warn!("--ephemeral is deprecated; set csi.storage.k8s.io/ephemeral in the volume context instead");
    }

    let config = DriverConfig {
        driver_name: args.driver_name,
        node_id: args.node_id,
        ephemeral: args.ephemeral,
        max_volumes_per_node: args.max_volumes_per_node,
        data_root: args.data_root,
        ..Default::default()
    };
    let backend = HostPathBackend::new(config).context("invalid driver configuration")?;
    backend.init().await?;

    let tls = server_tls(args.tls_cert.as_deref(), args.tls_key.as_deref())?;
    let server = CsiServer::new(args.endpoint, tls, Arc::new(backend))?;

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            server.close();
        }
    }
    Ok(())
}

/// Build the QUIC server TLS config from PEM files, or from a freshly
/// generated self-signed certificate when none are given.
fn server_tls(cert: Option<&Path>, key: Option<&Path>) -> anyhow::Result<rustls::ServerConfig> {
    let (certs, key) = match (cert, key) {
        (Some(cert), Some(key)) => {
            let certs = CertificateDer::pem_file_iter(cert)
                .with_context(|| format!("read certificate {}", cert.display()))?
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("parse certificate {}", cert.display()))?;
            let key = PrivateKeyDer::from_pem_file(key)
                .with_context(|| format!("read private key {}", key.display()))?;
            (certs, key)
        }
        _ => {
            warn!("no TLS certificate configured, generating a self-signed one");
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
            let cert_der = CertificateDer::from(cert.serialize_der()?);
            let key = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());
            (vec![cert_der], PrivateKeyDer::Pkcs8(key))
        }
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}
