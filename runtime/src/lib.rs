//! Minibox Runtime - minimal container runtime.
//!
//! Pulls an image from an OCI registry into a content-addressed layer cache,
//! assembles its root filesystem, and runs its command in fresh namespaces
//! with a veth pair and NAT for outbound networking.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod isolation;
pub mod network;
pub mod oci;
pub mod rootfs;
pub mod teardown;

// Re-export common types
pub use cache::LayerCache;
pub use isolation::{
    BootstrapStep, ContainerBootstrap, ContainerProcess, ExecTarget, IsolationLauncher,
    IsolationRequest,
};
pub use network::{CommandRunner, NetworkBridge, NetworkSetup, SystemRunner};
pub use oci::{
    ImageConfig, ImagePuller, ImageReference, ManifestIndex, PlatformManifest, PullToken,
    PulledImage, RegistryClient, RootfsAssembler,
};
pub use rootfs::RootfsMerger;
pub use teardown::{Teardown, TeardownReport};

/// Minibox Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
