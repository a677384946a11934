//! `pbx ps`: List containers.

use clap::Args;
use pocketbox_common::types::ContainerState;
use pocketbox_runtime::Engine;

use crate::output::{short_id, state_label};

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show all containers (including exited and dead).
    #[arg(short, long)]
    pub all: bool,
}

/// Executes the `ps` command.
pub fn execute(engine: &Engine, args: &PsArgs) {
    let containers: Vec<_> = engine
        .list_containers()
        .into_iter()
        .filter(|c| {
            args.all
                || !matches!(
                    c.state(),
                    ContainerState::Exited { .. } | ContainerState::Dead { .. }
                )
        })
        .collect();

    if containers.is_empty() {
        println!("No containers found.");
        return;
    }

    println!(
        "{:<14} {:<28} {:<18} {:<30} {:<16}",
        "CONTAINER ID", "NAME", "STATE", "IMAGE", "CREATED"
    );
    for container in &containers {
        let record = container.record();
        println!(
            "{:<14} {:<28} {:<18} {:<30} {:<16}",
            short_id(record.id.as_str()),
            record.name,
            state_label(&container.state()),
            record.image_name,
            record.created_at.format("%Y-%m-%d %H:%M")
        );
    }
}
