//! Driver configuration.
//!
//! [`DriverConfig`] is built once at startup (by the `hostpathplugin` binary
//! from its command line) and shared read-only by every service.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;

/// Default driver name registered with the orchestrator.
pub const DEFAULT_DRIVER_NAME: &str = "hostpath.csi.k8s.io";

/// Directory where volume data and snapshot archives live.
pub const DEFAULT_DATA_ROOT: &str = "/csi-data-dir";

/// Runtime configuration of the hostpath driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub driver_name: String,
    pub node_id: String,
    pub vendor_version: String,
    /// Root directory holding one entry per volume and snapshot.
    pub data_root: PathBuf,
    /// Node-wide default for publishes whose volume context does not say
    /// whether the volume is ephemeral.
    pub ephemeral: bool,
    /// Advertised volume limit; `0` means unlimited.
    pub max_volumes_per_node: u64,
    /// Capacity ceiling for any single volume, also used as the size of
    /// auto-provisioned ephemeral volumes.
    pub max_volume_size: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            node_id: String::new(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            ephemeral: false,
            max_volumes_per_node: 0,
            max_volume_size: TIB,
        }
    }
}

impl DriverConfig {
    /// Reject configurations the driver cannot start with.
    pub fn validate(&self) -> Result<(), CsiError> {
        if self.driver_name.is_empty() {
            return Err(CsiError::invalid("no driver name provided"));
        }
        if self.node_id.is_empty() {
            return Err(CsiError::invalid("no node id provided"));
        }
        if self.data_root.as_os_str().is_empty() {
            return Err(CsiError::invalid("no data root provided"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.driver_name, "hostpath.csi.k8s.io");
        assert_eq!(cfg.data_root, PathBuf::from("/csi-data-dir"));
        assert_eq!(cfg.max_volume_size, TIB);
        assert!(!cfg.ephemeral);
    }

    #[test]
    fn validate_requires_node_id() {
        let cfg = DriverConfig::default();
        assert!(matches!(cfg.validate(), Err(CsiError::InvalidArgument(_))));

        let cfg = DriverConfig {
            node_id: "node-1".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
