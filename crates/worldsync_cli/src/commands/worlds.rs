//! Worlds command implementation.

use std::path::PathBuf;
use tracing::info;
use worldsync_core::{LocalWorldSource, SavesDirectory, WorldId};

/// Runs the worlds command.
pub fn run(saves: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let source = match saves {
        Some(root) => SavesDirectory::new(root),
        None => SavesDirectory::platform_default()?,
    };
    info!(root = %source.root().display(), "listing saves");

    let worlds = source.list()?;
    if worlds.is_empty() {
        println!("No saves found in {}", source.root().display());
        return Ok(());
    }

    println!("{:<36}  {:<24}  Path", "Id", "Name");
    for world in worlds {
        println!(
            "{:<36}  {:<24}  {}",
            WorldId::from_name(&world.name),
            world.name,
            world.path.display()
        );
    }
    Ok(())
}
