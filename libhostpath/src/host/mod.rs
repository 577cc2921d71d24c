//! Host capabilities consumed by the driver core.
//!
//! Every OS-level primitive the core needs (loop devices, bind mounts,
//! archive extraction, recursive copy, space allocation) sits behind a narrow
//! async trait so that the registry, factory, cloner and publisher can be
//! exercised with in-memory fakes.  The system implementations below call
//! `nix` for mount syscalls and spawn the usual host tools through
//! `tokio::process` for everything else.

pub mod alloc;
pub mod archive;
pub mod loopdev;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use tokio::process::Command;
use tracing::debug;

use crate::error::CsiError;

pub use alloc::{Fallocate, SpaceAllocator};
pub use archive::{Archiver, Copier, CpCopier, TarArchiver};
pub use loopdev::{LoopDeviceManager, Losetup};
pub use mount::{Mounter, SystemMounter};

/// The set of host primitives handed to the driver core.
#[derive(Clone)]
pub struct HostCapabilities {
    pub loop_devices: Arc<dyn LoopDeviceManager>,
    pub mounter: Arc<dyn Mounter>,
    pub archiver: Arc<dyn Archiver>,
    pub copier: Arc<dyn Copier>,
    pub allocator: Arc<dyn SpaceAllocator>,
}

impl HostCapabilities {
    /// Capabilities bound to the real host: `losetup`, mount syscalls,
    /// `tar`, `cp` and `fallocate`.
    pub fn system() -> Self {
        Self {
            loop_devices: Arc::new(Losetup),
            mounter: Arc::new(SystemMounter),
            archiver: Arc::new(TarArchiver),
            copier: Arc::new(CpCopier),
            allocator: Arc::new(Fallocate),
        }
    }
}

/// Run a host tool to completion and return its stdout.
///
/// A spawn failure or non-zero exit becomes [`CsiError::ToolFailed`] carrying
/// the combined stdout/stderr, so callers can surface the diagnostic as-is.
pub(crate) async fn run_tool<I, S>(program: &str, args: I) -> Result<String, CsiError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    let command = std::iter::once(program.to_owned())
        .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ");
    debug!(%command, "running host tool");

    let output = Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(|e| CsiError::ToolFailed {
            command: command.clone(),
            output: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CsiError::ToolFailed {
            command,
            output: format!("{}{} ({})", stdout, stderr.trim_end(), output.status),
        });
    }
    Ok(stdout)
}
