use crate::layout::OutputLayout;
use crate::{fsync_dir, StoreError};
use bale_schema::PackageId;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Directory holding the parts of a build that has not committed yet.
///
/// It lives inside the output root so that [`commit`](Self::commit) is a
/// same-filesystem `rename(2)`: the package directory appears complete or not
/// at all. Dropping an uncommitted `StagingDir` removes it.
#[derive(Debug)]
pub struct StagingDir {
    dir: TempDir,
}

impl StagingDir {
    pub fn create(layout: &OutputLayout, id: &PackageId) -> Result<Self, StoreError> {
        let dir = tempfile::Builder::new()
            .prefix(&OutputLayout::staging_prefix(id))
            .tempdir_in(layout.root())?;
        debug!("created staging directory {}", dir.path().display());
        Ok(Self { dir })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Set `mode` on the directory and rename it to `dest` in one step.
    ///
    /// The returned [`CommittedDir`] still owns the rename: until
    /// [`finish`](CommittedDir::finish) is called it can be rolled back, and
    /// dropping it removes `dest`.
    pub fn commit(self, dest: &Path, mode: u32) -> Result<CommittedDir, StoreError> {
        if dest.exists() {
            return Err(StoreError::AlreadyExists(dest.to_path_buf()));
        }
        fs::set_permissions(self.dir.path(), fs::Permissions::from_mode(mode))?;
        fs::rename(self.dir.path(), dest)?;
        // The old path no longer exists; disarm the drop guard.
        let staging = self.dir.keep();
        let committed = CommittedDir {
            path: dest.to_path_buf(),
            staging,
            armed: true,
        };
        if let Some(parent) = dest.parent() {
            fsync_dir(parent)?;
        }
        Ok(committed)
    }

    /// Give up on the build. With `keep`, the directory is left in place for
    /// inspection and its path returned.
    pub fn abandon(self, keep: bool) -> Result<Option<PathBuf>, StoreError> {
        if keep {
            Ok(Some(self.dir.keep()))
        } else {
            self.dir.close()?;
            Ok(None)
        }
    }
}

/// A renamed package directory whose build has not finished committing.
#[derive(Debug)]
pub struct CommittedDir {
    path: PathBuf,
    staging: PathBuf,
    armed: bool,
}

impl CommittedDir {
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make the directory permanent.
    pub fn finish(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    /// Undo the commit. With `keep`, the directory is moved back to its
    /// staging name and that path returned; otherwise it is removed.
    pub fn roll_back(mut self, keep: bool) -> Result<Option<PathBuf>, StoreError> {
        self.armed = false;
        if keep {
            fs::rename(&self.path, &self.staging)?;
            debug!(
                "rolled back {} to {}",
                self.path.display(),
                self.staging.display()
            );
            Ok(Some(std::mem::take(&mut self.staging)))
        } else {
            fs::remove_dir_all(&self.path)?;
            debug!("rolled back {}", self.path.display());
            Ok(None)
        }
    }
}

impl Drop for CommittedDir {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, OutputLayout, PackageId) {
        let root = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(root.path());
        (root, layout, PackageId::new("pkg1"))
    }

    #[test]
    fn staging_lives_inside_root() {
        let (_root, layout, id) = setup();
        let staging = StagingDir::create(&layout, &id).unwrap();
        assert_eq!(staging.path().parent().unwrap(), layout.root());
        let name = staging.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("build-pkg1-"));
    }

    #[test]
    fn commit_renames_with_mode() {
        let (_root, layout, id) = setup();
        let staging = StagingDir::create(&layout, &id).unwrap();
        fs::write(staging.path().join("part.tgz"), b"x").unwrap();
        let old = staging.path().to_path_buf();

        let dest = layout.package_dir(&id);
        let committed = staging.commit(&dest, 0o755).unwrap();
        assert_eq!(committed.finish(), dest);

        assert!(!old.exists());
        assert!(dest.join("part.tgz").exists());
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn commit_refuses_existing_destination() {
        let (_root, layout, id) = setup();
        let dest = layout.package_dir(&id);
        fs::create_dir(&dest).unwrap();
        let staging = StagingDir::create(&layout, &id).unwrap();
        assert!(matches!(
            staging.commit(&dest, 0o755),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn abandon_removes_by_default() {
        let (_root, layout, id) = setup();
        let staging = StagingDir::create(&layout, &id).unwrap();
        let path = staging.path().to_path_buf();
        assert!(staging.abandon(false).unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn abandon_can_keep_for_inspection() {
        let (_root, layout, id) = setup();
        let staging = StagingDir::create(&layout, &id).unwrap();
        let path = staging.path().to_path_buf();
        let kept = staging.abandon(true).unwrap();
        assert_eq!(kept.as_deref(), Some(path.as_path()));
        assert!(path.exists());
    }

    #[test]
    fn drop_removes_uncommitted_staging() {
        let (_root, layout, id) = setup();
        let path = {
            let staging = StagingDir::create(&layout, &id).unwrap();
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn roll_back_removes_committed_dir() {
        let (_root, layout, id) = setup();
        let staging = StagingDir::create(&layout, &id).unwrap();
        fs::write(staging.path().join("part.tgz"), b"x").unwrap();
        let dest = layout.package_dir(&id);

        let committed = staging.commit(&dest, 0o755).unwrap();
        assert!(dest.exists());
        assert!(committed.roll_back(false).unwrap().is_none());
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(layout.root()).unwrap().count(), 0);
    }

    #[test]
    fn roll_back_can_restore_staging_name() {
        let (_root, layout, id) = setup();
        let staging = StagingDir::create(&layout, &id).unwrap();
        let staged = staging.path().to_path_buf();
        fs::write(staged.join("part.tgz"), b"x").unwrap();
        let dest = layout.package_dir(&id);

        let kept = staging.commit(&dest, 0o755).unwrap().roll_back(true).unwrap();
        assert_eq!(kept.as_deref(), Some(staged.as_path()));
        assert!(!dest.exists());
        assert!(staged.join("part.tgz").exists());
    }

    #[test]
    fn dropping_unfinished_commit_removes_dir() {
        let (_root, layout, id) = setup();
        let staging = StagingDir::create(&layout, &id).unwrap();
        let dest = layout.package_dir(&id);
        drop(staging.commit(&dest, 0o755).unwrap());
        assert!(!dest.exists());
    }
}
