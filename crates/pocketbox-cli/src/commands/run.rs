//! `pbx run`: Create a container and run it in the foreground.

use clap::Args;
use pocketbox_runtime::Engine;

use crate::commands::create::CreateArgs;
use crate::commands::{logs, start};
use crate::output::exit_code;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Remove the container once it has exited.
    #[arg(long)]
    pub rm: bool,

    #[command(flatten)]
    pub create: CreateArgs,
}

/// Executes the `run` command.
///
/// Prints the captured output after the container exits and returns its
/// exit code.
///
/// # Errors
///
/// Returns an error if creating, starting, or removing the container fails.
pub async fn execute(engine: &Engine, args: RunArgs) -> anyhow::Result<i32> {
    let container = args.create.create(engine).await?;
    container.start().await?;
    let state = start::foreground(&container).await?;

    logs::print(&engine.logs(container.id().as_str())?);
    if args.rm {
        container.remove().await?;
    }
    Ok(exit_code(&state))
}
