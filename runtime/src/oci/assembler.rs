//! Rootfs assembly from registry layers.
//!
//! Three phases, each a barrier for the next:
//!
//! 1. download every uncached layer blob concurrently
//! 2. extract every downloaded blob concurrently into its own cache entry
//! 3. merge all layers into the rootfs, strictly one after another
//!
//! A failure in any task of a concurrent phase aborts its siblings and the
//! whole assembly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use minibox_core::error::{BoxError, Result};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::task::{JoinError, JoinSet};

use super::layers::extract_layer;
use super::manifest::{split_digest, LayerDescriptor, PlatformManifest};
use super::reference::ImageReference;
use super::registry::{PullToken, RegistryClient};
use crate::cache::LayerCache;
use crate::rootfs::{make_tree_writable, RootfsMerger};

/// Compressed blobs fetched by `download_layers`, kept on disk until the
/// value is dropped.
#[derive(Debug)]
pub struct DownloadedLayers {
    _dir: Option<TempDir>,
    blobs: HashMap<String, PathBuf>,
}

impl DownloadedLayers {
    fn empty() -> Self {
        Self {
            _dir: None,
            blobs: HashMap::new(),
        }
    }

    /// Path of the downloaded blob for `digest`, if it was downloaded.
    pub fn blob_path(&self, digest: &str) -> Option<&Path> {
        self.blobs.get(digest).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

/// Builds a rootfs from a platform manifest's layers.
#[derive(Clone)]
pub struct RootfsAssembler {
    registry: RegistryClient,
    cache: LayerCache,
    rootfs_path: PathBuf,
}

impl RootfsAssembler {
    pub fn new(registry: RegistryClient, cache: LayerCache, rootfs_path: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            cache,
            rootfs_path: rootfs_path.into(),
        }
    }

    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }

    pub fn rootfs_path(&self) -> &Path {
        &self.rootfs_path
    }

    /// Run all three phases.
    pub async fn assemble(
        &self,
        reference: &ImageReference,
        manifest: &PlatformManifest,
        token: &PullToken,
    ) -> Result<()> {
        let downloaded = self.download_layers(reference, manifest, token).await?;
        self.extract_layers(manifest, &downloaded).await?;
        drop(downloaded);

        let merger = self.clone();
        let manifest = manifest.clone();
        tokio::task::spawn_blocking(move || merger.merge_into_rootfs(&manifest))
            .await
            .map_err(join_error)?
    }

    /// Download the blob of every layer without a cache entry. Returns once
    /// all downloads finished, or with the first failure after aborting the
    /// rest.
    pub async fn download_layers(
        &self,
        reference: &ImageReference,
        manifest: &PlatformManifest,
        token: &PullToken,
    ) -> Result<DownloadedLayers> {
        let pending = self.uncached_layers(manifest)?;
        if pending.is_empty() {
            tracing::info!("All layers cached, nothing to download");
            return Ok(DownloadedLayers::empty());
        }

        let dir = tempfile::Builder::new()
            .prefix("minibox-blobs-")
            .tempdir()
            .map_err(|e| BoxError::CacheError(format!("Failed to create download directory: {}", e)))?;

        tracing::info!(layers = pending.len(), "Downloading layers");

        let mut tasks = JoinSet::new();
        for layer in pending {
            let registry = self.registry.clone();
            let reference = reference.clone();
            let token = token.clone();
            let dest = dir.path().join(layer.digest().replace(':', "-"));
            tasks.spawn(async move {
                download_blob(&registry, &reference, &layer, &token, &dest).await?;
                Ok::<_, BoxError>((layer.digest().clone(), dest))
            });
        }

        let mut blobs = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(join_error).and_then(|r| r) {
                Ok((digest, path)) => {
                    blobs.insert(digest, path);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        Ok(DownloadedLayers {
            _dir: Some(dir),
            blobs,
        })
    }

    /// Unpack every downloaded blob into its layer's cache entry. Entries
    /// become visible only after a complete extraction.
    pub async fn extract_layers(
        &self,
        manifest: &PlatformManifest,
        downloaded: &DownloadedLayers,
    ) -> Result<()> {
        let pending = self.uncached_layers(manifest)?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for layer in pending {
            let blob = downloaded
                .blob_path(layer.digest())
                .ok_or_else(|| {
                    BoxError::LayerError(format!("Layer {} was not downloaded", layer.digest()))
                })?
                .to_path_buf();
            let cache = self.cache.clone();
            tasks.spawn_blocking(move || {
                let staging = cache.reserve(layer.digest())?;
                extract_layer(&blob, &staging)?;
                cache.commit(layer.digest())?;
                tracing::debug!(digest = %layer.digest(), "Layer extracted");
                Ok::<_, BoxError>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined.map_err(join_error).and_then(|r| r) {
                // Blocking tasks cannot be interrupted; aborting only
                // discards their results.
                tasks.abort_all();
                return Err(e);
            }
        }

        Ok(())
    }

    /// Rebuild the rootfs from the cached layers in manifest order.
    pub fn merge_into_rootfs(&self, manifest: &PlatformManifest) -> Result<()> {
        let layer_dirs = manifest
            .layers()
            .iter()
            .map(|layer| {
                let path = self.cache.entry_path(layer.digest())?;
                if !self.cache.exists(layer.digest())? {
                    return Err(BoxError::CacheError(format!(
                        "Layer {} missing from cache",
                        layer.digest()
                    )));
                }
                Ok(path)
            })
            .collect::<Result<Vec<_>>>()?;

        if self.rootfs_path.exists() {
            tracing::debug!(path = %self.rootfs_path.display(), "Removing previous rootfs");
            make_tree_writable(&self.rootfs_path);
            std::fs::remove_dir_all(&self.rootfs_path).map_err(|e| {
                BoxError::LayerError(format!(
                    "Failed to remove stale rootfs {}: {}",
                    self.rootfs_path.display(),
                    e
                ))
            })?;
        }

        RootfsMerger::new(&self.rootfs_path).merge_all(&layer_dirs)?;

        tracing::info!(
            rootfs = %self.rootfs_path.display(),
            layers = layer_dirs.len(),
            "Rootfs assembled"
        );
        Ok(())
    }

    /// Distinct layers of `manifest` with no committed cache entry.
    fn uncached_layers(&self, manifest: &PlatformManifest) -> Result<Vec<LayerDescriptor>> {
        let mut pending: Vec<LayerDescriptor> = Vec::new();
        for layer in manifest.layers() {
            if pending.iter().any(|p| p.digest() == layer.digest()) {
                continue;
            }
            if self.cache.exists(layer.digest())? {
                tracing::debug!(digest = %layer.digest(), "Layer cached");
                continue;
            }
            pending.push(layer.clone());
        }
        Ok(pending)
    }
}

/// Stream one blob to `dest`, hashing it on the way.
async fn download_blob(
    registry: &RegistryClient,
    reference: &ImageReference,
    layer: &LayerDescriptor,
    token: &PullToken,
    dest: &Path,
) -> Result<()> {
    let (algorithm, expected) = split_digest(layer.digest())?;
    let response = registry.fetch_blob(reference, layer, token).await?;

    let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
        BoxError::CacheError(format!("Failed to create {}: {}", dest.display(), e))
    })?;
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BoxError::RegistryError {
            registry: registry.registry().to_string(),
            message: format!("Failed to read blob {}: {}", layer.digest(), e),
        })?;
        hasher.update(&chunk);
        written += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(|e| {
            BoxError::CacheError(format!("Failed to write {}: {}", dest.display(), e))
        })?;
    }
    file.flush().await?;

    if algorithm == "sha256" {
        let actual = hex::encode(hasher.finalize());
        if actual != expected {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(BoxError::RegistryError {
                registry: registry.registry().to_string(),
                message: format!(
                    "Digest mismatch for {}: got sha256:{}",
                    layer.digest(), actual
                ),
            });
        }
    } else {
        tracing::warn!(digest = %layer.digest(), "Cannot verify blob digest algorithm");
    }

    tracing::debug!(digest = %layer.digest(), bytes = written, "Downloaded layer blob");
    Ok(())
}

fn join_error(e: JoinError) -> BoxError {
    BoxError::Other(format!("Layer task failed: {}", e))
}
