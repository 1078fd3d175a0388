//! High-level image acquisition.
//!
//! Resolves a reference to its linux/amd64 manifest, fetches the image
//! config and assembles the rootfs, reusing every layer already in the
//! local cache.

use std::path::PathBuf;

use minibox_core::config::RuntimeConfig;
use minibox_core::error::Result;

use super::assembler::RootfsAssembler;
use super::image::ImageConfig;
use super::manifest::PlatformManifest;
use super::reference::ImageReference;
use super::registry::{PullToken, RegistryClient};
use crate::cache::LayerCache;

/// An image ready to launch.
#[derive(Debug, Clone)]
pub struct PulledImage {
    pub reference: ImageReference,
    pub manifest: PlatformManifest,
    pub config: ImageConfig,
    /// Merged root filesystem
    pub rootfs: PathBuf,
}

/// Image puller with a content-addressed layer cache.
pub struct ImagePuller {
    registry: RegistryClient,
    assembler: RootfsAssembler,
    default_namespace: String,
}

impl ImagePuller {
    pub fn new(
        registry: RegistryClient,
        cache: LayerCache,
        rootfs_path: impl Into<PathBuf>,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            assembler: RootfsAssembler::new(registry.clone(), cache, rootfs_path),
            registry,
            default_namespace: default_namespace.into(),
        }
    }

    /// Build a puller from the runtime configuration's registry and layout.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let registry = RegistryClient::new(config.registry.clone())?;
        let cache = LayerCache::new(&config.layers_dir())?;
        Ok(Self::new(
            registry,
            cache,
            config.rootfs_dir(),
            config.registry.default_namespace.clone(),
        ))
    }

    pub fn assembler(&self) -> &RootfsAssembler {
        &self.assembler
    }

    /// Pull `image` and assemble its rootfs.
    pub async fn pull(&self, image: &str) -> Result<PulledImage> {
        let reference = ImageReference::parse(image, &self.default_namespace)?;
        tracing::info!(image = %reference, registry = %self.registry.registry(), "Pulling image");

        let token = self.registry.fetch_token(&reference).await?;
        let index = self.registry.fetch_manifest_index(&reference, &token).await?;
        let manifest = self
            .registry
            .select_platform_manifest(&reference, &index, &token)
            .await?;
        let config = self.registry.fetch_config(&reference, &manifest, &token).await?;

        tracing::info!(
            image = %reference,
            layers = manifest.layers().len(),
            "Resolved platform manifest"
        );

        let token = self.refresh(&reference, token).await?;
        self.assembler.assemble(&reference, &manifest, &token).await?;

        Ok(PulledImage {
            reference,
            manifest,
            config,
            rootfs: self.assembler.rootfs_path().to_path_buf(),
        })
    }

    /// Replace `token` if it expired while the metadata was fetched.
    async fn refresh(&self, reference: &ImageReference, token: PullToken) -> Result<PullToken> {
        if token.is_expired() {
            tracing::debug!("Pull token expired, requesting a new one");
            return self.registry.fetch_token(reference).await;
        }
        Ok(token)
    }
}
