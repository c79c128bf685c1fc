//! Output layout, staging directories, and atomic publication for Bale packages.
//!
//! This crate provides the storage layer: `OutputLayout` names every path a
//! package build produces, `StagingDir` holds parts while a build is in flight
//! and turns into the permanent package directory with a single rename, and
//! `StagedFile` writes files under temporary names so they only ever appear
//! complete.

pub mod layout;
pub mod publish;
pub mod staging;

pub use layout::OutputLayout;
pub use publish::{write_atomic, StagedFile};
pub use staging::{CommittedDir, StagingDir};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Mode of published part files, manifests, and signatures.
pub const PUBLIC_FILE_MODE: u32 = 0o644;
/// Mode of a committed package directory.
pub const PUBLIC_DIR_MODE: u32 = 0o755;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename survives a crash until the parent
/// directory itself has been synced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("output directory does not exist: {0}")]
    MissingOutputDir(PathBuf),
    #[error("output path is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("output directory {path} is not writable: {reason}")]
    NotWritable { path: PathBuf, reason: String },
    #[error("refusing to replace existing path: {0}")]
    AlreadyExists(PathBuf),
}

impl StoreError {
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::MissingOutputDir(_) | Self::NotADirectory(_) | Self::NotWritable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dir_problems_are_user_errors() {
        assert!(StoreError::MissingOutputDir(PathBuf::from("/x")).is_user_error());
        assert!(StoreError::NotADirectory(PathBuf::from("/x")).is_user_error());
        assert!(!StoreError::AlreadyExists(PathBuf::from("/x")).is_user_error());
        assert!(!StoreError::Io(std::io::Error::other("disk")).is_user_error());
    }

    #[test]
    fn store_error_display_not_writable() {
        let e = StoreError::NotWritable {
            path: PathBuf::from("/srv/out"),
            reason: "read-only file system".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("/srv/out"));
        assert!(msg.contains("read-only"));
    }
}
