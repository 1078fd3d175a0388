//! OCI image acquisition.
//!
//! Pulls an image from a registry and turns it into a root filesystem:
//!
//! ```text
//!  token ─► manifest index ─► platform manifest ─► config
//!                                   │
//!                                   ▼
//!             download layers ─► extract layers ─► merge into rootfs
//!              (concurrent)       (concurrent)      (sequential)
//! ```
//!
//! Extracted layers live in the [`LayerCache`](crate::cache::LayerCache)
//! keyed by digest, so a layer is fetched and unpacked at most once.

mod assembler;
mod image;
pub mod layers;
pub mod manifest;
mod pull;
pub mod reference;
pub mod registry;

pub use assembler::{DownloadedLayers, RootfsAssembler};
pub use image::ImageConfig;
pub use layers::extract_layer;
pub use manifest::{
    select_platform, Descriptor, LayerDescriptor, ManifestIndex, Platform, PlatformManifest,
};
pub use pull::{ImagePuller, PulledImage};
pub use reference::ImageReference;
pub use registry::{PullToken, RegistryClient};
