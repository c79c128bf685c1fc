use crate::{fsync_dir, StoreError};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A file being written under a temporary name in its destination directory.
///
/// Dropping a `StagedFile` without publishing removes it.
#[derive(Debug)]
pub struct StagedFile {
    tmp: NamedTempFile,
}

impl StagedFile {
    pub fn create_in(dir: &Path, prefix: &str) -> Result<Self, StoreError> {
        let tmp = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".tmp")
            .tempfile_in(dir)?;
        Ok(Self { tmp })
    }

    /// Stage `data` completely and durably under a temporary name.
    pub fn with_contents(dir: &Path, prefix: &str, data: &[u8]) -> Result<Self, StoreError> {
        let mut staged = Self::create_in(dir, prefix)?;
        staged.file_mut().write_all(data)?;
        staged.tmp.as_file().sync_all()?;
        Ok(staged)
    }

    pub fn file_mut(&mut self) -> &mut File {
        self.tmp.as_file_mut()
    }

    pub fn path(&self) -> &Path {
        self.tmp.path()
    }

    /// Open a fresh read handle positioned at the start of the file.
    pub fn reopen(&self) -> Result<File, StoreError> {
        Ok(self.tmp.reopen()?)
    }

    /// Sync, set `mode`, and rename into `dest`, then sync the directory.
    pub fn publish(self, dest: &Path, mode: u32) -> Result<PathBuf, StoreError> {
        self.tmp.as_file().sync_all()?;
        fs::set_permissions(self.tmp.path(), fs::Permissions::from_mode(mode))?;
        self.tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
        if let Some(parent) = dest.parent() {
            fsync_dir(parent)?;
        }
        Ok(dest.to_path_buf())
    }
}

/// Write `data` to `dest` so that readers see either nothing or the whole file.
pub fn write_atomic(dest: &Path, data: &[u8], mode: u32) -> Result<PathBuf, StoreError> {
    let dir = dest.parent().unwrap_or(Path::new("."));
    StagedFile::with_contents(dir, ".bale-", data)?.publish(dest, mode)
}
