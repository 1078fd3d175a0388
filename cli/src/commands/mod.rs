//! CLI command definitions and dispatch.

mod child;
mod download;
mod run;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use minibox_core::config::RuntimeConfig;
use minibox_runtime::{IsolationLauncher, NetworkBridge};

/// Minibox - pull an image and run it in fresh namespaces.
#[derive(Parser)]
#[command(name = "minibox", version, about)]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Leave the container without network wiring
    #[arg(long, global = true)]
    pub no_network: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Run a command in an isolated container on the assembled rootfs
    Run(run::RunArgs),
    /// Container-side entry point (used internally)
    #[command(hide = true)]
    Child(child::ChildArgs),
    /// Pull an image, run its command, then clean up
    Download(download::DownloadArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = RuntimeConfig::load(cli.config.as_deref())?;
    if cli.no_network {
        config.network.enabled = false;
    }

    match cli.command {
        Command::Run(args) => run::execute(args, &config).await,
        Command::Child(args) => child::execute(args, &config),
        Command::Download(args) => download::execute(args, &config).await,
    }
}

/// Launcher wiring the network only when enabled.
pub(crate) fn launcher(config: &RuntimeConfig) -> IsolationLauncher {
    IsolationLauncher::new(bridge(config))
}

pub(crate) fn bridge(config: &RuntimeConfig) -> Option<NetworkBridge> {
    config
        .network
        .enabled
        .then(|| NetworkBridge::new(config.network.clone()))
}

/// argv re-executing this binary as the container-side `child`.
pub(crate) fn child_argv(
    rootfs: &Path,
    hostname: &str,
    workdir: Option<&str>,
    command: &[String],
) -> Vec<String> {
    let argv0 = std::env::args().next().unwrap_or_else(|| "minibox".to_string());
    let mut argv = vec![
        argv0,
        "child".to_string(),
        "--rootfs".to_string(),
        rootfs.display().to_string(),
        "--hostname".to_string(),
        hostname.to_string(),
    ];
    if let Some(dir) = workdir {
        argv.push("--workdir".to_string());
        argv.push(dir.to_string());
    }
    argv.push("--".to_string());
    argv.extend(command.iter().cloned());
    argv
}
