use crate::StoreError;
use bale_schema::PackageId;
use std::path::{Path, PathBuf};

/// Paths produced by a package build inside one output directory:
///
/// ```text
/// <root>/<package_id>/<part_digest>.<ext>
/// <root>/<package_id>.json
/// <root>/<package_id>.json.sig
/// ```
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn package_dir(&self, id: &PackageId) -> PathBuf {
        self.root.join(id.as_str())
    }

    #[inline]
    pub fn manifest_file(&self, id: &PackageId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    #[inline]
    pub fn signature_file(&self, id: &PackageId) -> PathBuf {
        self.root.join(format!("{id}.json.sig"))
    }

    /// Name prefix of the in-flight staging directory for a build.
    #[inline]
    pub fn staging_prefix(id: &PackageId) -> String {
        format!("build-{id}-")
    }

    /// Confirm the root exists, is a directory, and accepts new files.
    pub fn check_writable(&self) -> Result<(), StoreError> {
        let meta = match std::fs::metadata(&self.root) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingOutputDir(self.root.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Err(StoreError::NotADirectory(self.root.clone()));
        }
        tempfile::tempfile_in(&self.root).map_err(|e| StoreError::NotWritable {
            path: self.root.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}
