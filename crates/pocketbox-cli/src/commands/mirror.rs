//! `pbx mirror`: Manage registry mirrors.

use clap::{Args, Subcommand};
use pocketbox_common::records::RegistryMirror;
use pocketbox_runtime::Engine;

use crate::output::{DIM, GREEN, RED, RESET};

/// Arguments for the `mirror` command.
#[derive(Args, Debug)]
pub struct MirrorArgs {
    /// Mirror action.
    #[command(subcommand)]
    pub action: MirrorAction,
}

/// Mirror subcommands.
#[derive(Subcommand, Debug)]
pub enum MirrorAction {
    /// List mirrors with their last known health.
    List,
    /// Add a custom mirror.
    Add {
        /// Unique mirror name.
        name: String,
        /// Base URL (`http://` or `https://`).
        url: String,
        /// Tie-break priority; higher wins.
        #[arg(long)]
        priority: Option<i32>,
        /// Bearer token sent instead of the challenge flow.
        #[arg(long)]
        token: Option<String>,
    },
    /// Remove a custom mirror.
    Remove {
        /// Mirror name.
        name: String,
    },
    /// Probe every mirror now.
    Check,
}

/// Executes the `mirror` command.
///
/// # Errors
///
/// Returns an error if the mirror is invalid or unknown, or the store fails.
pub async fn execute(engine: &Engine, args: MirrorArgs) -> anyhow::Result<()> {
    let mirrors = engine.mirrors();
    match args.action {
        MirrorAction::List => print_table(&mirrors.list()?, false),
        MirrorAction::Add {
            name,
            url,
            priority,
            token,
        } => {
            let mirror = mirrors.add_custom(&name, &url, token, priority)?;
            println!("Added {} ({})", mirror.name, mirror.url);
        }
        MirrorAction::Remove { name } => {
            mirrors.remove(&name)?;
            println!("Removed {name}");
        }
        MirrorAction::Check => print_table(&mirrors.check_all().await?, true),
    }
    Ok(())
}

/// Health is only known after a check in this process.
fn print_table(mirrors: &[RegistryMirror], checked: bool) {
    println!(
        "{:<20} {:<40} {:<9} {:<9} {:<10}",
        "NAME", "URL", "PRIORITY", "BUILT-IN", "HEALTH"
    );
    for mirror in mirrors {
        let health = match (mirror.is_healthy, mirror.latency_ms) {
            (true, Some(ms)) => format!("{GREEN}{ms} ms{RESET}"),
            (true, None) => format!("{GREEN}healthy{RESET}"),
            (false, _) if checked => format!("{RED}down{RESET}"),
            (false, _) => format!("{DIM}unknown{RESET}"),
        };
        println!(
            "{:<20} {:<40} {:<9} {:<9} {health}",
            mirror.name,
            mirror.url,
            mirror.priority,
            if mirror.is_built_in { "yes" } else { "no" },
        );
    }
}
