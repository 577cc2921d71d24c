//! CSI Identity service trait.
//!
//! Callers use the Identity service to discover which driver they are
//! talking to and whether it is healthy.  Every CSI plugin implements it.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

/// Identity service: plugin discovery and health probing.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Return the configured driver name and vendor version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Readiness probe.  Returns `true` once the data root is usable.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Advertise the optional services and features of this plugin.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
