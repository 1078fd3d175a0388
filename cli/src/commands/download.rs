//! `minibox download` command - pull, run, tear down.

use clap::Args;
use minibox_core::config::RuntimeConfig;
use minibox_runtime::{ImagePuller, IsolationRequest, Teardown};

#[derive(Args)]
pub struct DownloadArgs {
    /// Image reference (e.g., "alpine", "redis:7", "bitnami/redis:latest")
    pub image: String,

    /// Command replacing the image's Cmd
    #[arg(last = true)]
    pub cmd: Vec<String>,
}

pub async fn execute(args: DownloadArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let puller = ImagePuller::from_config(config)?;
    let image = puller.pull(&args.image).await?;

    let command = image.config.argv_with(Some(args.cmd.as_slice()));
    if command.is_empty() {
        return Err(format!("{} defines no command; pass one after --", image.reference).into());
    }

    let argv = super::child_argv(
        &image.rootfs,
        &config.hostname,
        image.config.working_dir.as_deref(),
        &command,
    );
    let request = IsolationRequest::for_current_user(argv, Some(image.config.env_pairs()));

    let launcher = super::launcher(config);
    let result = launcher.run(&request).await;

    let mut teardown = Teardown::new(&image.rootfs);
    if let Some(bridge) = launcher.bridge() {
        teardown = teardown.with_bridge(bridge.clone());
    }
    if !config.keep_layers {
        teardown = teardown.purge_layers(puller.assembler().cache().clone());
    }
    let report = teardown.run().await;
    if !report.is_clean() {
        tracing::warn!(failures = report.failures.len(), "Teardown incomplete");
    }

    result.map_err(Into::into)
}
