//! Content-addressed cache for extracted image layers.
//!
//! Each layer is stored by its digest, so a layer that was extracted once is
//! never downloaded or extracted again. Entries are written into a staging
//! directory and only become visible once `commit` renames them into place,
//! which keeps a crash during extraction from looking like a cache hit.
//!
//! Staging directories carry the PID of the process extracting into them,
//! so several processes can share one cache. Opening the cache purges only
//! staging directories whose owner is gone.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use minibox_core::error::{BoxError, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Suffix of staging directories for entries being extracted.
const STAGING_SUFFIX: &str = ".partial";

/// Content-addressed cache for extracted layers.
///
/// Layers are stored under `cache_dir/<digest-with-colons-as-dashes>/`.
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// Root directory for the layer cache (e.g., ~/.minibox/layers)
    cache_dir: PathBuf,
}

impl LayerCache {
    /// Open the layer cache at the given directory, creating it if absent.
    ///
    /// Staging directories left behind by exited processes are purged.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        // create_dir_all treats "already exists" as success, so concurrent
        // openers do not race each other.
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            BoxError::CacheError(format!(
                "Failed to create layer cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        let cache = Self {
            cache_dir: cache_dir.to_path_buf(),
        };
        cache.purge_staging()?;
        Ok(cache)
    }

    /// Root directory of the cache.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory of the committed entry for `digest`.
    pub fn entry_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.cache_dir.join(Self::digest_to_dirname(digest)?))
    }

    /// Whether a committed entry exists for `digest`.
    pub fn exists(&self, digest: &str) -> Result<bool> {
        let path = self.entry_path(digest)?;
        match std::fs::metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BoxError::CacheError(format!(
                "Failed to stat cache entry {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Return a fresh, empty staging directory that will hold the extracted
    /// contents of `digest` until `commit`.
    pub fn reserve(&self, digest: &str) -> Result<PathBuf> {
        let staging = self.staging_path(digest)?;

        if staging.exists() {
            tracing::warn!(
                digest = %digest,
                path = %staging.display(),
                "Discarding incomplete layer extraction"
            );
            std::fs::remove_dir_all(&staging).map_err(|e| {
                BoxError::CacheError(format!(
                    "Failed to remove stale staging directory {}: {}",
                    staging.display(),
                    e
                ))
            })?;
        }

        std::fs::create_dir_all(&staging).map_err(|e| {
            BoxError::CacheError(format!(
                "Failed to create staging directory {}: {}",
                staging.display(),
                e
            ))
        })?;

        Ok(staging)
    }

    /// Atomically publish the staging directory of `digest` as a complete
    /// cache entry. Returns the committed entry path.
    pub fn commit(&self, digest: &str) -> Result<PathBuf> {
        let staging = self.staging_path(digest)?;
        let entry = self.entry_path(digest)?;

        if entry.exists() {
            // Someone else committed the same content first; entries are immutable.
            let _ = std::fs::remove_dir_all(&staging);
            return Ok(entry);
        }

        if let Err(e) = std::fs::rename(&staging, &entry) {
            if entry.exists() {
                // Lost a commit race against another process.
                let _ = std::fs::remove_dir_all(&staging);
                return Ok(entry);
            }
            return Err(BoxError::CacheError(format!(
                "Failed to commit cache entry {}: {}",
                entry.display(),
                e
            )));
        }

        tracing::debug!(digest = %digest, path = %entry.display(), "Committed layer cache entry");
        Ok(entry)
    }

    /// Remove the whole cache directory.
    pub fn purge(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BoxError::CacheError(format!(
                "Failed to remove layer cache {}: {}",
                self.cache_dir.display(),
                e
            ))),
        }
    }

    fn staging_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.cache_dir.join(format!(
            "{}.{}{}",
            Self::digest_to_dirname(digest)?,
            std::process::id(),
            STAGING_SUFFIX
        )))
    }

    fn purge_staging(&self) -> Result<()> {
        let read_dir = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            BoxError::CacheError(format!(
                "Failed to read cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        for entry in read_dir {
            let entry = entry.map_err(|e| {
                BoxError::CacheError(format!("Failed to read directory entry: {}", e))
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(STAGING_SUFFIX) else {
                continue;
            };
            if !owner_is_alive(stem) {
                tracing::info!(path = %entry.path().display(), "Purging incomplete cache entry");
                std::fs::remove_dir_all(entry.path()).map_err(|e| {
                    BoxError::CacheError(format!(
                        "Failed to purge {}: {}",
                        entry.path().display(),
                        e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Convert a digest string to a safe directory name.
    ///
    /// Replaces ':' with '-', e.g. "sha256:abc123" → "sha256-abc123".
    fn digest_to_dirname(digest: &str) -> Result<String> {
        let valid = !digest.is_empty()
            && digest.contains(':')
            && digest
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '+' | '.'))
            && !digest.starts_with('.');
        if !valid {
            return Err(BoxError::CacheError(format!(
                "Refusing to use '{}' as a cache key",
                digest
            )));
        }
        Ok(digest.replace(':', "-"))
    }
}

/// Whether the process named in a staging stem (`<entry>.<pid>`) still runs.
fn owner_is_alive(stem: &str) -> bool {
    let pid = stem
        .rsplit_once('.')
        .and_then(|(_, pid)| pid.parse::<i32>().ok())
        .filter(|pid| *pid > 0);
    match pid {
        // EPERM still means the process exists.
        Some(pid) => kill(Pid::from_raw(pid), None) != Err(Errno::ESRCH),
        None => false,
    }
}
