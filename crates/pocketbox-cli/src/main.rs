//! # pbx: the Pocketbox CLI
//!
//! Rootless container runtime built on proot.
//! Single binary for pulling images and running containers.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]
// Terminal output is what this binary is for.
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod commands;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let code = commands::execute(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
