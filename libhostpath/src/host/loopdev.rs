//! Loop device lifecycle for block-access volumes.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::run_tool;
use crate::error::CsiError;

/// Attaches sparse backing files to loop devices and back.
///
/// Bindings are never cached: the device for a backing file is looked up
/// from the kernel each time it is needed.
#[async_trait]
pub trait LoopDeviceManager: Send + Sync {
    /// Bind `backing_file` to a free loop device and return the device path.
    async fn attach(&self, backing_file: &Path) -> Result<PathBuf, CsiError>;

    /// Release a loop device, given either the device itself or its backing
    /// file.  Detaching something that is not attached succeeds.
    async fn detach(&self, device_or_file: &Path) -> Result<(), CsiError>;

    /// Return the loop device currently bound to `backing_file`, or
    /// [`CsiError::LoopDeviceNotFound`].
    async fn lookup(&self, backing_file: &Path) -> Result<PathBuf, CsiError>;
}

/// [`LoopDeviceManager`] backed by util-linux `losetup`.
pub struct Losetup;

#[async_trait]
impl LoopDeviceManager for Losetup {
    async fn attach(&self, backing_file: &Path) -> Result<PathBuf, CsiError> {
        let out = run_tool(
            "losetup",
            [OsStr::new("-f"), OsStr::new("--show"), backing_file.as_os_str()],
        )
        .await?;
        let device = out.trim();
        if device.is_empty() {
            return Err(CsiError::Internal(format!(
                "losetup printed no device for {}",
                backing_file.display()
            )));
        }
        info!(backing_file = %backing_file.display(), %device, "loop device attached");
        Ok(PathBuf::from(device))
    }

    async fn detach(&self, device_or_file: &Path) -> Result<(), CsiError> {
        let device = if is_loop_device(device_or_file) {
            device_or_file.to_path_buf()
        } else {
            match self.lookup(device_or_file).await {
                Ok(device) => device,
                Err(e) if e.is_not_found() => {
                    debug!(path = %device_or_file.display(), "no loop device bound, nothing to detach");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };

        match run_tool("losetup", [OsStr::new("-d"), device.as_os_str()]).await {
            Ok(_) => {
                info!(device = %device.display(), "loop device detached");
                Ok(())
            }
            Err(CsiError::ToolFailed { output, .. })
                if output.contains("No such device or address") =>
            {
                debug!(device = %device.display(), "loop device already detached");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn lookup(&self, backing_file: &Path) -> Result<PathBuf, CsiError> {
        let out = run_tool("losetup", [OsStr::new("-j"), backing_file.as_os_str()]).await?;
        parse_associated_device(&out)
            .ok_or_else(|| CsiError::LoopDeviceNotFound(backing_file.display().to_string()))
    }
}

/// `true` for paths like `/dev/loop3`.
fn is_loop_device(path: &Path) -> bool {
    path.parent() == Some(Path::new("/dev"))
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("loop"))
}

/// Extract the device from `losetup -j` output, whose lines look like
/// `/dev/loop0: [2049]:131 (/csi-data-dir/v1)`.
fn parse_associated_device(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(device, _)| device.trim())
        .find(|device| !device.is_empty())
        .map(PathBuf::from)
}
