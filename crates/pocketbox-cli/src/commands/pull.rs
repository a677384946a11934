//! `pbx pull`: Pull an image from a registry.

use std::collections::HashMap;

use clap::Args;
use pocketbox_image::pull::{UNIT_CONFIG, UNIT_IMAGE, UNIT_MANIFEST};
use pocketbox_image::{ImageReference, PullStatus};
use pocketbox_runtime::Engine;

use crate::output::{BOLD, DIM, GREEN, RESET, format_bytes, short_id};

/// Arguments for the `pull` command.
#[derive(Args, Debug)]
pub struct PullArgs {
    /// Image reference, e.g. `alpine:3.19` or `ghcr.io/owner/tool:1.0`.
    pub reference: String,
}

/// Executes the `pull` command.
///
/// Prints one line per layer status change and a summary once the image
/// record is stored.
///
/// # Errors
///
/// Returns an error if the reference is invalid or the pull fails.
pub async fn execute(engine: &Engine, args: PullArgs) -> anyhow::Result<()> {
    let reference = ImageReference::parse(&args.reference)?;
    eprintln!("  Pulling {BOLD}{reference}{RESET}...");

    let mut handle = engine.pull_image(reference.clone());
    let mut last_status: HashMap<String, PullStatus> = HashMap::new();
    while let Some(event) = handle.next().await {
        if last_status.insert(event.unit_id.clone(), event.status) == Some(event.status) {
            continue;
        }
        let unit = match event.unit_id.as_str() {
            UNIT_MANIFEST | UNIT_CONFIG | UNIT_IMAGE => event.unit_id.clone(),
            digest => short_id(digest).to_string(),
        };
        match event.status {
            PullStatus::Waiting => eprintln!("    {DIM}{unit}: waiting{RESET}"),
            PullStatus::Downloading => eprintln!(
                "    {unit}: downloading {}",
                format_bytes(event.total)
            ),
            PullStatus::Done if event.unit_id == UNIT_IMAGE => {}
            PullStatus::Done => eprintln!("    {GREEN}{unit}: done{RESET}"),
            PullStatus::Error => {}
        }
    }

    let image = handle.finish().await?;
    eprintln!();
    eprintln!(
        "  {GREEN}{BOLD}Pulled{RESET} {} {DIM}[{}] {}{RESET}",
        image.display_name(),
        short_id(image.id.as_str()),
        format_bytes(image.size)
    );
    Ok(())
}
