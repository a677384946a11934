//! `pbx start`: Run an existing container in the foreground.

use anyhow::Context;
use clap::Args;
use pocketbox_common::types::ContainerState;
use pocketbox_runtime::{Container, Engine};

use crate::output::{BOLD, DIM, GREEN, RESET, YELLOW, exit_code, state_label};

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Container ID or name.
    pub container: String,
}

/// Executes the `start` command.
///
/// Returns the container's exit code.
///
/// # Errors
///
/// Returns an error if the container is unknown or cannot start.
pub async fn execute(engine: &Engine, args: StartArgs) -> anyhow::Result<i32> {
    let container = engine.container(&args.container)?;
    container.start().await?;
    let state = foreground(&container).await?;
    eprintln!(
        "  {DIM}Output captured; see{RESET} {BOLD}pbx logs {}{RESET}",
        container.name()
    );
    Ok(exit_code(&state))
}

/// Waits for a started container to finish, stopping it on Ctrl+C.
///
/// # Errors
///
/// Returns an error if the Ctrl+C handler cannot be installed or stopping
/// fails.
pub async fn foreground(container: &Container) -> anyhow::Result<ContainerState> {
    let (tx, mut interrupted) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("failed to set Ctrl+C handler")?;

    eprintln!(
        "  {GREEN}●{RESET} {BOLD}{}{RESET} running. Press {BOLD}Ctrl+C{RESET} to stop.",
        container.name()
    );
    let state = tokio::select! {
        state = container.wait_until(|s| {
            !matches!(s, ContainerState::Starting | ContainerState::Running | ContainerState::Stopping)
        }) => state?,
        _ = interrupted.recv() => {
            eprintln!();
            eprintln!("  {YELLOW}Stopping{RESET} {}...", container.name());
            container.stop().await?
        }
    };
    eprintln!("  {} is {}", container.name(), state_label(&state));
    Ok(state)
}
