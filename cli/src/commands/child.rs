//! `minibox child` command - runs inside the new namespaces.

use std::path::PathBuf;

use clap::Args;
use minibox_core::config::RuntimeConfig;
use minibox_runtime::{ContainerBootstrap, ExecTarget};

#[derive(Args)]
pub struct ChildArgs {
    /// Root filesystem to chroot into
    #[arg(long)]
    pub rootfs: Option<PathBuf>,

    /// Container hostname
    #[arg(long)]
    pub hostname: Option<String>,

    /// Working directory inside the container
    #[arg(long)]
    pub workdir: Option<String>,

    /// Command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Set up the container and exec the command. Returns only on failure.
pub fn execute(args: ChildArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let target = ExecTarget {
        argv: args.command,
        env: std::env::vars_os().collect(),
    };
    let bootstrap = ContainerBootstrap::new(
        args.rootfs.unwrap_or_else(|| config.rootfs_dir()),
        args.hostname.unwrap_or_else(|| config.hostname.clone()),
        args.workdir.as_deref(),
        target,
    );

    match bootstrap.run() {
        Ok(never) => match never {},
        Err(e) => Err(e.into()),
    }
}
