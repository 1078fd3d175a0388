//! Image configuration parsing.
//!
//! The config blob carries the launch command, entrypoint and environment.

use minibox_core::error::{BoxError, Result};
use oci_spec::image::ImageConfiguration;

/// Parsed image configuration with entrypoint and environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    /// Entrypoint command (argv prefix)
    pub entrypoint: Vec<String>,

    /// Default command arguments
    pub cmd: Vec<String>,

    /// Environment variables, in image order, as `KEY=VALUE`
    pub env: Vec<String>,

    /// Working directory
    pub working_dir: Option<String>,
}

impl ImageConfig {
    /// Parse the raw config blob JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let oci_config: ImageConfiguration = serde_json::from_slice(bytes)
            .map_err(|e| BoxError::SerializationError(format!("Failed to parse config: {}", e)))?;
        Ok(Self::from_oci_config(&oci_config))
    }

    /// Extract the launch settings from an OCI image configuration.
    pub fn from_oci_config(oci_config: &ImageConfiguration) -> Self {
        let Some(config) = oci_config.config() else {
            return Self::default();
        };

        Self {
            entrypoint: config.entrypoint().clone().unwrap_or_default(),
            cmd: config.cmd().clone().unwrap_or_default(),
            env: config.env().clone().unwrap_or_default(),
            working_dir: config.working_dir().clone().filter(|w| !w.is_empty()),
        }
    }

    /// Effective launch argv: `entrypoint + cmd` when an entrypoint is set,
    /// otherwise `cmd`.
    pub fn effective_argv(&self) -> Vec<String> {
        self.argv_with(None)
    }

    /// Effective argv with `cmd` replaced by `cmd_override` when it is non-empty.
    pub fn argv_with(&self, cmd_override: Option<&[String]>) -> Vec<String> {
        let cmd = match cmd_override {
            Some(c) if !c.is_empty() => c,
            _ => self.cmd.as_slice(),
        };
        self.entrypoint.iter().chain(cmd.iter()).cloned().collect()
    }

    /// Environment as `(key, value)` pairs; malformed entries are skipped.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|e| {
                e.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }
}
