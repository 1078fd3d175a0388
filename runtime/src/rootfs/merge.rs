//! Layer merge into the container root filesystem.
//!
//! Extracted layers are applied one after another, bottom-most first. Each
//! layer directory is walked and its tree copied over the rootfs, with
//! whiteout markers deleting lower-layer paths instead of producing files.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use minibox_core::error::{BoxError, Result};

use crate::oci::layers::reject_symlink_ancestors;

/// Prefix marking a whiteout: `.wh.<name>` deletes `<name>` from lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker clearing all lower-layer contents of its directory.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Counters for a single merged layer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub directories: usize,
    pub files: usize,
    pub symlinks: usize,
    pub whiteouts: usize,
    /// Symlinks not created because the destination already existed
    pub symlinks_skipped: usize,
}

/// Merges extracted layers into a root filesystem directory.
pub struct RootfsMerger {
    /// Target rootfs directory.
    rootfs_path: PathBuf,
}

impl RootfsMerger {
    /// Create a merger targeting `rootfs_path`.
    pub fn new(rootfs_path: impl Into<PathBuf>) -> Self {
        Self {
            rootfs_path: rootfs_path.into(),
        }
    }

    pub fn rootfs_path(&self) -> &Path {
        &self.rootfs_path
    }

    /// Merge `layers` in order. Each layer is fully applied before the next
    /// one starts.
    pub fn merge_all<P: AsRef<Path>>(&self, layers: &[P]) -> Result<()> {
        fs::create_dir_all(&self.rootfs_path).map_err(|e| {
            BoxError::LayerError(format!(
                "Failed to create rootfs directory {}: {}",
                self.rootfs_path.display(),
                e
            ))
        })?;

        for (index, layer) in layers.iter().enumerate() {
            let stats = self.merge_layer(layer.as_ref())?;
            tracing::debug!(
                index,
                layer = %layer.as_ref().display(),
                files = stats.files,
                directories = stats.directories,
                symlinks = stats.symlinks,
                whiteouts = stats.whiteouts,
                "Merged layer"
            );
        }

        Ok(())
    }

    /// Apply a single extracted layer on top of the rootfs.
    pub fn merge_layer(&self, layer_dir: &Path) -> Result<MergeStats> {
        let mut stats = MergeStats::default();
        let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

        self.merge_dir(layer_dir, Path::new(""), &mut stats, &mut dir_modes)?;

        // Final directory modes go on last so read-only directories could
        // still receive their children.
        for (dir, mode) in dir_modes.into_iter().rev() {
            fs::set_permissions(&dir, fs::Permissions::from_mode(mode))
                .map_err(|e| merge_error("chmod", &dir, e))?;
        }

        Ok(stats)
    }

    fn merge_dir(
        &self,
        layer_root: &Path,
        rel: &Path,
        stats: &mut MergeStats,
        dir_modes: &mut Vec<(PathBuf, u32)>,
    ) -> Result<()> {
        let source_dir = layer_root.join(rel);
        let mut entries = fs::read_dir(&source_dir)
            .map_err(|e| merge_error("read", &source_dir, e))?
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| merge_error("read", &source_dir, e))?;
        entries.sort_by_key(|e| e.file_name());

        // Deletions first: they target lower layers only.
        if entries.iter().any(|e| e.file_name() == OPAQUE_MARKER) {
            self.clear_dir(rel)?;
            stats.whiteouts += 1;
        }
        for entry in &entries {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == OPAQUE_MARKER {
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                self.apply_whiteout(&rel.join(hidden))?;
                stats.whiteouts += 1;
            }
        }

        for entry in entries {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(WHITEOUT_PREFIX) {
                continue;
            }

            let entry_rel = rel.join(&name);
            let source = entry.path();
            let dest = self.rootfs_path.join(&entry_rel);
            reject_symlink_ancestors(&self.rootfs_path, &entry_rel)?;

            let file_type = entry
                .file_type()
                .map_err(|e| merge_error("stat", &source, e))?;

            if file_type.is_symlink() {
                if fs::symlink_metadata(&dest).is_ok() {
                    // First writer wins.
                    stats.symlinks_skipped += 1;
                    continue;
                }
                let target = fs::read_link(&source).map_err(|e| merge_error("readlink", &source, e))?;
                std::os::unix::fs::symlink(&target, &dest)
                    .map_err(|e| merge_error("symlink", &dest, e))?;
                stats.symlinks += 1;
            } else if file_type.is_dir() {
                let mode = entry
                    .metadata()
                    .map_err(|e| merge_error("stat", &source, e))?
                    .permissions()
                    .mode()
                    & 0o7777;
                ensure_dir(&dest, mode)?;
                dir_modes.push((dest, mode));
                stats.directories += 1;
                self.merge_dir(layer_root, &entry_rel, stats, dir_modes)?;
            } else if file_type.is_file() {
                remove_existing(&dest)?;
                fs::copy(&source, &dest).map_err(|e| merge_error("copy", &source, e))?;
                let mode = fs::metadata(&source)
                    .map_err(|e| merge_error("stat", &source, e))?
                    .permissions()
                    .mode();
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o7777))
                    .map_err(|e| merge_error("chmod", &dest, e))?;
                stats.files += 1;
            } else {
                return Err(BoxError::UnsupportedEntryType {
                    entry_type: format!("{:?}", file_type),
                    path: entry_rel.display().to_string(),
                });
            }
        }

        Ok(())
    }

    /// Remove `rel` from the rootfs, whatever it is.
    fn apply_whiteout(&self, rel: &Path) -> Result<()> {
        reject_symlink_ancestors(&self.rootfs_path, rel)?;
        let target = self.rootfs_path.join(rel);
        tracing::trace!(path = %rel.display(), "Whiteout");
        remove_existing(&target)
    }

    /// Empty the rootfs directory `rel` of everything lower layers put there.
    fn clear_dir(&self, rel: &Path) -> Result<()> {
        let dir = self.rootfs_path.join(rel);
        let read_dir = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(merge_error("read", &dir, e)),
        };
        for entry in read_dir {
            let entry = entry.map_err(|e| merge_error("read", &dir, e))?;
            remove_existing(&entry.path())?;
        }
        tracing::trace!(path = %rel.display(), "Opaque directory cleared");
        Ok(())
    }
}

/// Make sure `path` is a directory writable by us. A non-directory from a
/// lower layer is replaced.
fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            remove_existing(path)?;
            create_dir(path, mode)?;
        }
        Err(_) => create_dir(path, mode)?,
    }
    let current = fs::metadata(path)
        .map_err(|e| merge_error("stat", path, e))?
        .permissions()
        .mode();
    if current & 0o700 != 0o700 {
        fs::set_permissions(path, fs::Permissions::from_mode(current | 0o700))
            .map_err(|e| merge_error("chmod", path, e))?;
    }
    Ok(())
}

fn create_dir(path: &Path, mode: u32) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode | 0o700)
        .create(path)
        .map_err(|e| merge_error("mkdir", path, e))
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            make_tree_writable(path);
            fs::remove_dir_all(path).map_err(|e| merge_error("remove", path, e))
        }
        Ok(_) => fs::remove_file(path).map_err(|e| merge_error("remove", path, e)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(merge_error("stat", path, e)),
    }
}

/// Grant owner rwx on every directory below `path` so it can be removed
/// without privileges.
pub(crate) fn make_tree_writable(path: &Path) {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if !meta.is_dir() {
            return;
        }
        let mode = meta.permissions().mode();
        if mode & 0o700 != 0o700 {
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700));
        }
        if let Ok(read_dir) = fs::read_dir(path) {
            for entry in read_dir.flatten() {
                make_tree_writable(&entry.path());
            }
        }
    }
}

fn merge_error(op: &str, path: &Path, err: std::io::Error) -> BoxError {
    BoxError::LayerError(format!("Failed to {} {}: {}", op, path.display(), err))
}
