//! Minibox Core - Foundational Types
//!
//! Error taxonomy, runtime configuration and network addressing types
//! shared by the runtime and the CLI.

pub mod config;
pub mod error;
pub mod network;

// Re-export commonly used types
pub use config::{RegistryConfig, RuntimeConfig};
pub use error::{BoxError, Result};
pub use network::{BridgeConfig, InterfaceAddr};

/// Minibox version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
