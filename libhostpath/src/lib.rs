//! # libhostpath: hostpath CSI driver over QUIC
//!
//! `libhostpath` implements a single-node [Container Storage Interface][csi]
//! driver whose volumes live on the node's own filesystem.  Mount volumes are
//! directories under a data root; block volumes are sparse files attached to
//! loop devices.  Requests arrive as [`CsiMessage`] values over QUIC (via
//! [`quinn`]) and are served by [`HostPathBackend`], built on the Tokio
//! runtime with `tracing` for observability and `thiserror` for structured
//! errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: volumes, snapshots, capabilities, requests. |
//! | [`error`] | [`CsiError`] and its CSI status code classification. |
//! | [`config`] | [`DriverConfig`] shared by every service. |
//! | [`registry`] | In-memory volume and snapshot records with name indexes. |
//! | [`locks`] | Per-volume async locks. |
//! | [`host`] | Loop devices, mounts, archives, copy and allocation primitives. |
//! | [`factory`] | Creating and destroying volume backing storage. |
//! | [`cloner`] | Pre-populating volumes from snapshots or other volumes. |
//! | [`publisher`] | Node-side publish/unpublish state machine. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volumes, snapshots, capacity. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, expand. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | [`HostPathBackend`] wiring it all together. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod cloner;
pub mod config;
pub mod controller;
pub mod error;
pub mod factory;
pub mod host;
pub mod identity;
pub mod locks;
pub mod message;
pub mod node;
pub mod publisher;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::HostPathBackend;
pub use config::DriverConfig;
pub use controller::CsiController;
pub use error::{CsiError, StatusCode};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
