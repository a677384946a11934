//! `pbx exec`: Run a command beside a container's main process.

use clap::Args;
use pocketbox_common::types::ContainerState;
use pocketbox_runtime::Engine;
use pocketbox_runtime::logs::ContainerLogs;

use crate::commands::logs;
use crate::output::{DIM, RESET};

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container ID or name.
    pub container: String,

    /// Command to execute.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `exec` command.
///
/// Starts the container when it is not running, runs the command to
/// completion, prints its output, and stops the container again if this
/// invocation started it. Returns the command's exit code.
///
/// # Errors
///
/// Returns an error if the container cannot be started or the command
/// cannot be spawned.
pub async fn execute(engine: &Engine, args: ExecArgs) -> anyhow::Result<i32> {
    let container = engine.container(&args.container)?;
    let started_here = matches!(
        container.state(),
        ContainerState::Created | ContainerState::Exited { .. }
    );
    if started_here {
        eprintln!("  {DIM}Starting {} for exec{RESET}", container.name());
        container.start().await?;
    }

    let result = async {
        let process = container.exec(args.command).await?;
        process.close_stdin().await;
        let code = process.wait().await;
        let output = ContainerLogs {
            stdout: tokio::fs::read_to_string(&process.logs().stdout)
                .await
                .unwrap_or_default(),
            stderr: tokio::fs::read_to_string(&process.logs().stderr)
                .await
                .unwrap_or_default(),
        };
        logs::print(&output);
        anyhow::Ok(code)
    }
    .await;

    if started_here && container.state() == ContainerState::Running {
        let _ = container.stop().await?;
    }
    result
}
