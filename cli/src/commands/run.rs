//! `minibox run` command - isolate a command on the assembled rootfs.

use clap::Args;
use minibox_core::config::RuntimeConfig;
use minibox_runtime::IsolationRequest;

#[derive(Args)]
pub struct RunArgs {
    /// Command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub async fn execute(args: RunArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let argv = super::child_argv(&config.rootfs_dir(), &config.hostname, None, &args.command);
    // Host environment passes through.
    let request = IsolationRequest::for_current_user(argv, None);

    let launcher = super::launcher(config);
    let result = launcher.run(&request).await;

    if let Some(bridge) = launcher.bridge() {
        if let Err(e) = bridge.teardown().await {
            tracing::warn!(error = %e, "Network cleanup failed");
        }
    }

    result.map_err(Into::into)
}
