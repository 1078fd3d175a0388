//! Container network wiring.
//!
//! `NetworkBridge` connects a container's network namespace to the host
//! with a veth pair and a masquerade rule. Host tools are driven through
//! `CommandRunner`.

mod bridge;
mod command;

pub use bridge::{nat_script, parse_default_route, NetworkBridge, NetworkSetup};
pub use command::{CommandOutput, CommandRunner, SystemRunner};
