//! Process isolation.
//!
//! The parent builds an [`IsolationRequest`] and hands it to the
//! [`IsolationLauncher`], which clones a child into new PID, UTS, network,
//! user and mount namespaces. The child re-executes this binary and runs a
//! [`ContainerBootstrap`] that ends by replacing itself with the target
//! command.

mod bootstrap;
mod launcher;
mod request;

pub use bootstrap::{resolve_executable, BootstrapStep, ContainerBootstrap, ExecTarget, DEFAULT_PATH};
pub use launcher::{ContainerProcess, IsolationLauncher};
pub use request::{IdMap, IsolationRequest, NamespaceSet};
