//! `pbx logs`: Print a container's captured output.

use clap::Args;
use pocketbox_runtime::Engine;
use pocketbox_runtime::logs::ContainerLogs;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container ID or name.
    pub container: String,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or its logs are unreadable.
pub fn execute(engine: &Engine, args: &LogsArgs) -> anyhow::Result<()> {
    print(&engine.logs(&args.container)?);
    Ok(())
}

/// Writes captured stdout and stderr to the matching streams.
pub fn print(logs: &ContainerLogs) {
    print!("{}", logs.stdout);
    eprint!("{}", logs.stderr);
}
