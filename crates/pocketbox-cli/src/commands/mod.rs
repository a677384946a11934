//! CLI command definitions and dispatch.

pub mod create;
pub mod exec;
pub mod images;
pub mod info;
pub mod logs;
pub mod mirror;
pub mod ps;
pub mod pull;
pub mod rm;
pub mod run;
pub mod start;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pocketbox_common::config::EngineConfig;
use pocketbox_common::constants;
use pocketbox_common::records::ImageRecord;
use pocketbox_image::ImageReference;
use pocketbox_runtime::Engine;

/// Pocketbox: rootless container runtime built on proot.
///
/// Containers run as children of the `pbx` process: `start`, `run` and
/// `exec` stay in the foreground until the container exits or Ctrl+C stops it.
#[derive(Parser, Debug)]
#[command(name = "pbx", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding images, containers and metadata.
    #[arg(long, global = true, env = "POCKETBOX_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pull an image from a registry.
    Pull(pull::PullArgs),
    /// List or remove local images.
    Images(images::ImagesArgs),
    /// Create a container from a local image.
    Create(create::CreateArgs),
    /// Create a container and run it in the foreground.
    Run(run::RunArgs),
    /// Run an existing container in the foreground.
    Start(start::StartArgs),
    /// Run a command beside a container's main process.
    Exec(exec::ExecArgs),
    /// Remove a container.
    Rm(rm::RmArgs),
    /// List containers.
    Ps(ps::PsArgs),
    /// Print a container's captured output.
    Logs(logs::LogsArgs),
    /// Manage registry mirrors.
    Mirror(mirror::MirrorArgs),
    /// Show the data directory, sandbox version and live processes.
    Info,
}

/// Dispatches the parsed CLI command to its handler and returns the process
/// exit code.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened or the command fails.
pub async fn execute(cli: Cli) -> anyhow::Result<i32> {
    tracing::debug!(command = ?cli.command, "dispatching command");
    let engine = open_engine(cli.data_dir).await?;
    let result = match cli.command {
        Command::Pull(args) => pull::execute(&engine, args).await.map(|()| 0),
        Command::Images(args) => images::execute(&engine, args).map(|()| 0),
        Command::Create(args) => create::execute(&engine, args).await.map(|()| 0),
        Command::Run(args) => run::execute(&engine, args).await,
        Command::Start(args) => start::execute(&engine, args).await,
        Command::Exec(args) => exec::execute(&engine, args).await,
        Command::Rm(args) => rm::execute(&engine, args).await.map(|()| 0),
        Command::Ps(args) => {
            ps::execute(&engine, &args);
            Ok(0)
        }
        Command::Logs(args) => logs::execute(&engine, &args).map(|()| 0),
        Command::Mirror(args) => mirror::execute(&engine, args).await.map(|()| 0),
        Command::Info => {
            info::execute(&engine).await;
            Ok(0)
        }
    };
    engine.shutdown().await;
    result
}

async fn open_engine(data_dir: Option<PathBuf>) -> anyhow::Result<Engine> {
    let data_dir = data_dir.unwrap_or_else(constants::default_data_dir);
    let config = EngineConfig::load_or_default(&data_dir)
        .with_context(|| format!("failed to load configuration from {}", data_dir.display()))?;
    Engine::open(config)
        .await
        .with_context(|| format!("failed to open data directory {}", data_dir.display()))
}

/// Finds a local image by id, id prefix, or reference.
///
/// # Errors
///
/// Returns an error if no image or more than one image matches.
pub fn find_image(engine: &Engine, query: &str) -> anyhow::Result<ImageRecord> {
    let images = engine.list_images()?;
    let reference = ImageReference::parse(query).ok();

    let by_reference = reference.as_ref().and_then(|r| {
        images
            .iter()
            .find(|i| i.registry == r.registry && i.repository == r.repository && i.tag == r.tag)
    });
    if let Some(image) = by_reference {
        return Ok(image.clone());
    }

    let id = query.strip_prefix("sha256:").unwrap_or(query);
    let mut by_id = images.iter().filter(|i| i.id.as_str().starts_with(id));
    match (by_id.next(), by_id.next()) {
        (Some(image), None) => Ok(image.clone()),
        (Some(_), Some(_)) => anyhow::bail!("image id prefix '{query}' is ambiguous"),
        (None, _) => anyhow::bail!("image not found: {query} (pull it first)"),
    }
}
