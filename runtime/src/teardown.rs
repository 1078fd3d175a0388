//! Post-exit cleanup of a container's host resources.
//!
//! Teardown is best-effort: every step runs even when an earlier one failed,
//! and failures are collected in a [`TeardownReport`] instead of aborting.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};

use crate::cache::LayerCache;
use crate::network::NetworkBridge;
use crate::rootfs::make_tree_writable;

/// Outcome of a teardown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// One message per failed step
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: &str, message: impl std::fmt::Display) {
        tracing::warn!(step, error = %message, "Teardown step failed");
        self.failures.push(format!("{}: {}", step, message));
    }
}

/// Resources to release once the container has exited.
#[derive(Debug, Clone)]
pub struct Teardown {
    rootfs: PathBuf,
    bridge: Option<NetworkBridge>,
    purge_layers: Option<LayerCache>,
}

impl Teardown {
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            bridge: None,
            purge_layers: None,
        }
    }

    /// Also remove the network wiring made by `bridge`.
    pub fn with_bridge(mut self, bridge: NetworkBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Also delete the layer cache.
    pub fn purge_layers(mut self, cache: LayerCache) -> Self {
        self.purge_layers = Some(cache);
        self
    }

    /// Unmount, remove the rootfs, remove the NAT table, optionally purge
    /// the layer cache.
    pub async fn run(&self) -> TeardownReport {
        let mut report = TeardownReport::default();

        // Mounts live in the container's mount namespace and normally die
        // with it; a leftover is only possible with shared propagation.
        detach(&self.rootfs.join("proc"));
        detach(&self.rootfs);

        let rootfs = self.rootfs.clone();
        match tokio::task::spawn_blocking(move || remove_tree(&rootfs)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => report.record("remove rootfs", e),
            Err(e) => report.record("remove rootfs", e),
        }

        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.teardown().await {
                report.record("remove network", e);
            }
        }

        if let Some(cache) = &self.purge_layers {
            if let Err(e) = cache.purge() {
                report.record("purge layers", e);
            }
        }

        if report.is_clean() {
            tracing::info!(rootfs = %self.rootfs.display(), "Teardown complete");
        }
        report
    }
}

fn detach(target: &Path) {
    if let Err(e) = umount2(target, MntFlags::MNT_DETACH) {
        tracing::trace!(path = %target.display(), error = %e, "Nothing to unmount");
    }
}

fn remove_tree(path: &Path) -> std::io::Result<()> {
    make_tree_writable(path);
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{CommandOutput, CommandRunner};
    use async_trait::async_trait;
    use minibox_core::error::Result;
    use minibox_core::network::BridgeConfig;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Every command fails the way it does when nothing was ever created.
    struct NothingCreated;

    #[async_trait]
    impl CommandRunner for NothingCreated {
        async fn run(&self, program: &str, _args: &[String], _stdin: Option<&str>) -> Result<CommandOutput> {
            Ok(match program {
                "nft" => CommandOutput::failed(1, "Error: No such file or directory"),
                _ => CommandOutput::failed(1, "Cannot find device \"mbx-host0\""),
            })
        }
    }

    struct Denied;

    #[async_trait]
    impl CommandRunner for Denied {
        async fn run(&self, _program: &str, _args: &[String], _stdin: Option<&str>) -> Result<CommandOutput> {
            Ok(CommandOutput::failed(1, "Operation not permitted"))
        }
    }

    #[tokio::test]
    async fn test_teardown_removes_rootfs() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("proc")).unwrap();
        std::fs::create_dir_all(rootfs.join("ro")).unwrap();
        std::fs::write(rootfs.join("ro/file"), "x").unwrap();
        std::fs::set_permissions(rootfs.join("ro"), std::fs::Permissions::from_mode(0o555)).unwrap();

        let report = Teardown::new(&rootfs).run().await;
        assert!(report.is_clean(), "{:?}", report);
        assert!(!rootfs.exists());
    }

    #[tokio::test]
    async fn test_teardown_missing_rootfs_is_clean() {
        let tmp = TempDir::new().unwrap();
        let report = Teardown::new(tmp.path().join("never-created")).run().await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_teardown_after_partial_network_setup() {
        let tmp = TempDir::new().unwrap();
        let bridge = NetworkBridge::with_runner(BridgeConfig::default(), Arc::new(NothingCreated));

        let report = Teardown::new(tmp.path().join("rootfs"))
            .with_bridge(bridge)
            .run()
            .await;
        assert!(report.is_clean(), "{:?}", report);
    }

    #[tokio::test]
    async fn test_teardown_continues_after_failure() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        let cache = LayerCache::new(&tmp.path().join("layers")).unwrap();
        let bridge = NetworkBridge::with_runner(BridgeConfig::default(), Arc::new(Denied));

        let report = Teardown::new(&rootfs)
            .with_bridge(bridge)
            .purge_layers(cache)
            .run()
            .await;

        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("remove network"));
        assert!(!rootfs.exists());
        assert!(!tmp.path().join("layers").exists());
    }
}
