//! `pbx info`: Show the data directory, sandbox and live processes.

use pocketbox_runtime::Engine;

use crate::output::{BOLD, DIM, RED, RESET};

/// Executes the `info` command.
pub async fn execute(engine: &Engine) {
    let config = engine.config();
    println!("{BOLD}pbx{RESET} {}", env!("CARGO_PKG_VERSION"));
    println!("  Data dir:  {}", config.data_dir.display());
    match engine.sandbox_version().await {
        Ok(version) => println!("  Sandbox:   proot {version}"),
        Err(e) => println!("  Sandbox:   {RED}unavailable{RESET} {DIM}({e}){RESET}"),
    }
    println!("  Platform:  {}/{}", config.os, config.architecture);
    println!("  Processes: {}", engine.processes().len());
}
