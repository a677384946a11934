//! `pbx images`: List or remove local images.

use clap::Args;
use pocketbox_runtime::Engine;

use crate::commands::find_image;
use crate::output::{format_bytes, short_id};

/// Arguments for the `images` command.
#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Remove an image by ID or reference.
    #[arg(long)]
    pub remove: Option<String>,
}

/// Executes the `images` command.
///
/// # Errors
///
/// Returns an error if the image to remove does not exist or the store
/// fails.
pub fn execute(engine: &Engine, args: ImagesArgs) -> anyhow::Result<()> {
    if let Some(query) = args.remove {
        let image = find_image(engine, &query)?;
        engine.delete_image(&image.id)?;
        println!("Removed {}", image.display_name());
        return Ok(());
    }

    let mut images = engine.list_images()?;
    if images.is_empty() {
        println!("No images found.");
        return Ok(());
    }
    images.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    println!(
        "{:<14} {:<40} {:<8} {:<7} {:>10}",
        "IMAGE ID", "NAME", "ARCH", "LAYERS", "SIZE"
    );
    for image in &images {
        println!(
            "{:<14} {:<40} {:<8} {:<7} {:>10}",
            short_id(image.id.as_str()),
            image.display_name(),
            image.architecture,
            image.layer_digests.len(),
            format_bytes(image.size)
        );
    }
    Ok(())
}
