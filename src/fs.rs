//! Filesystem access for provisioning steps.
//!
//! [`HostFs`] resolves image paths such as `/etc/apt/sources.list.d` under a
//! configurable root directory, which is `/` when provisioning the running
//! image and a scratch directory in tests. [`ScopedTempDir`] is the RAII
//! holder for per-step temporary files.

use std::fs;
use std::io;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::error::ProvisionError;

/// Host filesystem rooted at the image root.
///
/// In dry-run mode, mutating operations are logged and skipped.
#[derive(Debug, Clone)]
pub struct HostFs {
    root: Utf8PathBuf,
    dry_run: bool,
}

impl HostFs {
    pub fn new(root: impl Into<Utf8PathBuf>, dry_run: bool) -> Self {
        Self {
            root: root.into(),
            dry_run,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Maps an image path to the corresponding host path.
    ///
    /// Absolute paths are re-anchored under the root; relative paths are
    /// taken relative to the root as well.
    pub fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        let relative = path.as_str().trim_start_matches('/');
        if relative.is_empty() {
            return self.root.clone();
        }
        self.root.join(relative)
    }

    pub fn exists(&self, path: &Utf8Path) -> bool {
        self.resolve(path).exists()
    }

    /// Creates a directory and its parents. Succeeds if it already exists.
    pub fn create_dir(&self, path: &Utf8Path) -> Result<(), ProvisionError> {
        let target = self.resolve(path);
        if self.dry_run {
            info!("dry run: would create directory {}", target);
            return Ok(());
        }
        fs::create_dir_all(&target)
            .map_err(|e| ProvisionError::io(format!("failed to create directory: {}", target), e))
    }

    /// Writes `content` to `path`, replacing any existing file.
    ///
    /// Parent directories are created as needed.
    pub fn write_file(
        &self,
        path: &Utf8Path,
        content: &str,
        mode: Option<u32>,
    ) -> Result<(), ProvisionError> {
        let target = self.resolve(path);
        if self.dry_run {
            info!("dry run: would write {} ({} bytes)", target, content.len());
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ProvisionError::io(format!("failed to create directory: {}", parent), e)
            })?;
        }
        fs::write(&target, content)
            .map_err(|e| ProvisionError::io(format!("failed to write file: {}", target), e))?;
        if let Some(mode) = mode {
            set_file_mode(&target, mode)?;
        }
        debug!("wrote {}", target);
        Ok(())
    }

    pub fn read_to_string(&self, path: &Utf8Path) -> Result<String, ProvisionError> {
        let target = self.resolve(path);
        fs::read_to_string(&target)
            .map_err(|e| ProvisionError::io(format!("failed to read file: {}", target), e))
    }

    /// Deletes a file. Fails if the file does not exist.
    pub fn remove_file(&self, path: &Utf8Path) -> Result<(), ProvisionError> {
        let target = self.resolve(path);
        if self.dry_run {
            info!("dry run: would remove {}", target);
            return Ok(());
        }
        fs::remove_file(&target)
            .map_err(|e| ProvisionError::io(format!("failed to remove file: {}", target), e))
    }

    /// Deletes a directory tree. A missing directory is not an error.
    pub fn remove_tree(&self, path: &Utf8Path) -> Result<(), ProvisionError> {
        let target = self.resolve(path);
        if self.dry_run {
            info!("dry run: would remove directory tree {}", target);
            return Ok(());
        }
        match fs::remove_dir_all(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("directory already absent: {}", target);
                Ok(())
            }
            Err(e) => Err(ProvisionError::io(format!("failed to remove directory: {}", target), e)),
        }
    }

    /// Renames `from` to `to`, replacing `to` if it exists.
    pub fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), ProvisionError> {
        let source = self.resolve(from);
        let target = self.resolve(to);
        if self.dry_run {
            info!("dry run: would move {} to {}", source, target);
            return Ok(());
        }
        fs::rename(&source, &target).map_err(|e| {
            ProvisionError::io(format!("failed to move {} to {}", source, target), e)
        })
    }
}

/// Sets Unix file permissions on the given path.
#[cfg(unix)]
pub(crate) fn set_file_mode(path: &Utf8Path, mode: u32) -> Result<(), ProvisionError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| ProvisionError::io(format!("failed to set permissions on {}", path), e))
}

#[cfg(not(unix))]
pub(crate) fn set_file_mode(_path: &Utf8Path, _mode: u32) -> Result<(), ProvisionError> {
    Ok(())
}

/// RAII guard for a uniquely named temporary directory.
///
/// The directory is removed with its contents when the guard is dropped,
/// whichever way the owning step exits. In dry-run mode the directory is
/// neither created nor removed.
pub struct ScopedTempDir {
    path: Utf8PathBuf,
    dry_run: bool,
}

impl ScopedTempDir {
    pub fn create(parent: &Utf8Path, prefix: &str, dry_run: bool) -> Result<Self> {
        let path = parent.join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        if !dry_run {
            fs::create_dir_all(&path)
                .with_context(|| format!("failed to create temporary directory {}", path))?;
            set_file_mode(&path, 0o700)?;
        }
        debug!("created temporary directory {}", path);
        Ok(Self { path, dry_run })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> Utf8PathBuf {
        self.path.join(name)
    }

    /// Writes a file inside the directory (skipped in dry-run mode).
    pub fn write(&self, name: &str, content: &str) -> Result<Utf8PathBuf> {
        let target = self.join(name);
        if !self.dry_run {
            fs::write(&target, content).with_context(|| format!("failed to write {}", target))?;
        }
        Ok(target)
    }
}

impl Drop for ScopedTempDir {
    fn drop(&mut self) {
        if self.dry_run {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("cleaned up temporary directory: {}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("temporary directory already removed: {}", self.path);
            }
            Err(e) => {
                tracing::error!(
                    path = %self.path,
                    error_kind = ?e.kind(),
                    "failed to clean up temporary directory: {}",
                    e,
                );
            }
        }
    }
}
