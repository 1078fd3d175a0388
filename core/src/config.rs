use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BoxError, Result};
use crate::network::BridgeConfig;

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Working directory holding `layers/` and `rootfs/`
    pub work_dir: PathBuf,

    /// Registry endpoints
    pub registry: RegistryConfig,

    /// Hostname set inside the container UTS namespace
    pub hostname: String,

    /// Container network wiring
    pub network: BridgeConfig,

    /// Keep the extracted layer cache when tearing a container down
    pub keep_layers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            registry: RegistryConfig::default(),
            hostname: "container".to_string(),
            network: BridgeConfig::default(),
            keep_layers: true,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration: defaults, then an optional YAML file, then
    /// `MINIBOX_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoxError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Apply environment overrides through `lookup` so tests can inject values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(home) = lookup("MINIBOX_HOME") {
            self.work_dir = PathBuf::from(home);
        }
        if let Some(url) = lookup("MINIBOX_REGISTRY") {
            self.registry.registry_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("MINIBOX_AUTH_URL") {
            self.registry.auth_url = url;
        }
        if let Some(iface) = lookup("MINIBOX_EXTERNAL_IFACE") {
            self.network.external_interface = Some(iface);
        }
        if let Some(v) = lookup("MINIBOX_NO_NETWORK") {
            if matches!(v.as_str(), "1" | "true" | "yes") {
                self.network.enabled = false;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() || self.hostname.len() > 64 {
            return Err(BoxError::ConfigError(format!(
                "invalid hostname '{}'",
                self.hostname
            )));
        }
        if self.network.enabled {
            self.network.validate().map_err(BoxError::ConfigError)?;
        }
        Ok(())
    }

    /// Directory holding one extracted tree per layer digest.
    pub fn layers_dir(&self) -> PathBuf {
        self.work_dir.join("layers")
    }

    /// Merged root filesystem used as the chroot target.
    pub fn rootfs_dir(&self) -> PathBuf {
        self.work_dir.join("rootfs")
    }
}

/// Registry endpoints for anonymous token-authenticated pulls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Token endpoint (e.g., "https://auth.docker.io/token")
    pub auth_url: String,

    /// Service name sent with token requests
    pub service: String,

    /// Registry base URL (e.g., "https://registry-1.docker.io")
    pub registry_url: String,

    /// Namespace prepended to bare image names
    pub default_namespace: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auth_url: "https://auth.docker.io/token".to_string(),
            service: "registry.docker.io".to_string(),
            registry_url: "https://registry-1.docker.io".to_string(),
            default_namespace: "library".to_string(),
        }
    }
}

/// Return the default working directory (~/.minibox).
fn default_work_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".minibox"))
        .unwrap_or_else(|| PathBuf::from(".minibox"))
}
