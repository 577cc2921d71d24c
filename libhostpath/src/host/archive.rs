//! Snapshot archives and recursive copies.

use std::ffi::{OsStr, OsString};
use std::path::Path;

use async_trait::async_trait;

use super::run_tool;
use crate::error::CsiError;

/// Creates and extracts gzip'd tar archives of volume directories.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archive the contents of `source_dir` into `archive`.
    async fn create(&self, source_dir: &Path, archive: &Path) -> Result<(), CsiError>;

    /// Extract `archive` into `dest_dir`, preserving file attributes.
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<(), CsiError>;
}

/// Recursive, attribute-preserving directory copy.
#[async_trait]
pub trait Copier: Send + Sync {
    /// Copy everything inside `source_dir` into `dest_dir`.
    async fn copy_tree(&self, source_dir: &Path, dest_dir: &Path) -> Result<(), CsiError>;
}

/// [`Archiver`] backed by `tar`.
pub struct TarArchiver;

#[async_trait]
impl Archiver for TarArchiver {
    async fn create(&self, source_dir: &Path, archive: &Path) -> Result<(), CsiError> {
        run_tool(
            "tar",
            [
                OsStr::new("czf"),
                archive.as_os_str(),
                OsStr::new("-C"),
                source_dir.as_os_str(),
                OsStr::new("."),
            ],
        )
        .await
        .map(drop)
    }

    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<(), CsiError> {
        run_tool(
            "tar",
            [
                OsStr::new("zxvf"),
                archive.as_os_str(),
                OsStr::new("-C"),
                dest_dir.as_os_str(),
            ],
        )
        .await
        .map(drop)
    }
}

/// [`Copier`] backed by `cp -a`.
pub struct CpCopier;

#[async_trait]
impl Copier for CpCopier {
    async fn copy_tree(&self, source_dir: &Path, dest_dir: &Path) -> Result<(), CsiError> {
        // `<src>/.` copies the directory's contents, hidden entries included.
        let mut src = OsString::from(source_dir.as_os_str());
        src.push("/.");
        let mut dest = OsString::from(dest_dir.as_os_str());
        dest.push("/");
        run_tool("cp", [OsString::from("-a"), src, dest])
            .await
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tar_roundtrip_preserves_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(src.join("nested/data.txt"), b"payload").unwrap();

        let archive = tmp.path().join("snap.tgz");
        TarArchiver.create(&src, &archive).await.unwrap();
        assert!(archive.exists());

        TarArchiver.extract(&archive, &dest).await.unwrap();
        assert_eq!(
            std::fs::read(dest.join("nested/data.txt")).unwrap(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn extract_missing_archive_is_internal() {
        let tmp = tempfile::tempdir().unwrap();
        let err = TarArchiver
            .extract(&tmp.path().join("missing.tgz"), tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::ToolFailed { .. }));
    }

    #[tokio::test]
    async fn cp_copies_hidden_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(src.join(".hidden"), b"h").unwrap();
        std::fs::write(src.join("visible"), b"v").unwrap();

        CpCopier.copy_tree(&src, &dest).await.unwrap();
        assert!(dest.join(".hidden").exists());
        assert!(dest.join("visible").exists());
    }
}
