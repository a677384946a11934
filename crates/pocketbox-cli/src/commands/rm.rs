//! `pbx rm`: Remove a container.

use clap::Args;
use pocketbox_runtime::Engine;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container IDs or names.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

/// Executes the `rm` command.
///
/// # Errors
///
/// Returns the first failure; containers listed before it are removed.
pub async fn execute(engine: &Engine, args: RmArgs) -> anyhow::Result<()> {
    for name in &args.containers {
        let container = engine.container(name)?;
        container.remove().await?;
        println!("{name}");
    }
    Ok(())
}
