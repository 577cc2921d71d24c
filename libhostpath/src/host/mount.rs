//! Bind mounts and mount point detection.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{MsFlags, mount, umount};
use tracing::{debug, warn};

use crate::error::CsiError;

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Bind-mount `source` (a directory or device node) onto `target`.
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool)
    -> Result<(), CsiError>;

    /// Unmount `target`.  A target that does not exist is not an error.
    async fn unmount(&self, target: &Path) -> Result<(), CsiError>;

    /// Whether `path` is currently a mount point.
    async fn is_mountpoint(&self, path: &Path) -> Result<bool, CsiError>;
}

/// Apply the read-only remount of a fresh bind.  When the remount fails the
/// writable bind is taken down again so that a retried publish does not find
/// it and report success.
fn remount_read_only<R, U>(target: &Path, remount: R, unmount: U) -> Result<(), CsiError>
where
    R: FnOnce() -> nix::Result<()>,
    U: FnOnce() -> nix::Result<()>,
{
    let Err(e) = remount() else {
        return Ok(());
    };
    if let Err(rollback) = unmount() {
        warn!(
            path = %target.display(),
            error = %rollback,
            "failed to undo writable bind after read-only remount failure",
        );
    }
    Err(CsiError::MountFailed {
        path: target.display().to_string(),
        reason: format!("remount read-only: {e}"),
    })
}

/// [`Mounter`] using `mount(2)` / `umount(2)` and `/proc/self/mounts`.
pub struct SystemMounter;

#[async_trait]
impl Mounter for SystemMounter {
    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| CsiError::MountFailed {
            path: target.display().to_string(),
            reason: format!("bind {}: {e}", source.display()),
        })?;

        // MS_RDONLY is ignored on the initial bind; it only takes effect on a
        // remount of the bind.
        if read_only {
            remount_read_only(
                target,
                || {
                    mount(
                        None::<&str>,
                        target,
                        None::<&str>,
                        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                        None::<&str>,
                    )
                },
                || umount(target),
            )?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        match umount(target) {
            Ok(()) => Ok(()),
            Err(Errno::ENOENT) => {
                debug!(path = %target.display(), "unmount target does not exist");
                Ok(())
            }
            Err(e) => Err(CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn is_mountpoint(&self, path: &Path) -> Result<bool, CsiError> {
        let contents = tokio::fs::read_to_string("/proc/self/mounts")
            .await
            .map_err(|e| CsiError::Internal(format!("read /proc/self/mounts: {e}")))?;
        Ok(mount_points(&contents).any(|mp| mp == path))
    }
}

/// Mount points listed in a `/proc/*/mounts` table.
///
/// Format: `<device> <mountpoint> <fstype> <options> <dump> <pass>`.
fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
}

/// Decode the octal escapes (`\040` for space, `\011` for tab, ...) the
/// kernel applies to whitespace and backslashes in mount table fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
