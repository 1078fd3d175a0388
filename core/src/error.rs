use thiserror::Error;

/// Minibox error types
#[derive(Error, Debug)]
pub enum BoxError {
    /// Pull token could not be obtained from the auth endpoint
    #[error("Auth error: {0}")]
    AuthError(String),

    /// Container registry error (bad status, malformed document, digest mismatch)
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// The manifest index has no entry for the requested platform
    #[error("Unsupported platform: no {os}/{arch} manifest in image index")]
    UnsupportedPlatform { os: String, arch: String },

    /// Layer cache I/O error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Layer archive contains an entry type we do not materialize
    #[error("Unsupported archive entry type {entry_type} at {path}")]
    UnsupportedEntryType { entry_type: String, path: String },

    /// Layer extraction or rootfs merge failure
    #[error("Layer error: {0}")]
    LayerError(String),

    /// Hostname, chroot, mount or namespace creation failure
    #[error("Namespace setup failed: {0}")]
    NamespaceSetup(String),

    /// Target command not found in the container PATH
    #[error("Executable not found: {0}")]
    ExecResolution(String),

    /// Veth, address, route or NAT rule failure
    #[error("Network setup failed: {0}")]
    NetworkSetup(String),

    /// The container process exited unsuccessfully
    #[error("Container exited unsuccessfully: {status}")]
    ContainerFailed { status: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for BoxError {
    fn from(err: serde_json::Error) -> Self {
        BoxError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BoxError {
    fn from(err: serde_yaml::Error) -> Self {
        BoxError::SerializationError(err.to_string())
    }
}

/// Result type alias for minibox operations
pub type Result<T> = std::result::Result<T, BoxError>;
