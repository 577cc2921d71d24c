//! Space reservation for block-volume backing files.

use std::ffi::OsStr;
use std::path::Path;

use async_trait::async_trait;

use super::run_tool;
use crate::error::CsiError;

#[async_trait]
pub trait SpaceAllocator: Send + Sync {
    /// Create `path` (if needed) and reserve `size_bytes` for it.
    async fn allocate(&self, path: &Path, size_bytes: u64) -> Result<(), CsiError>;
}

/// [`SpaceAllocator`] backed by util-linux `fallocate -l`.
pub struct Fallocate;

#[async_trait]
impl SpaceAllocator for Fallocate {
    async fn allocate(&self, path: &Path, size_bytes: u64) -> Result<(), CsiError> {
        let length = size_bytes.to_string();
        run_tool(
            "fallocate",
            [OsStr::new("-l"), OsStr::new(&length), path.as_os_str()],
        )
        .await
        .map(drop)
    }
}
