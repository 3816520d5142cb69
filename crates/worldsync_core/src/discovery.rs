//! Enumeration of save directories installed on this machine.

use crate::error::{CoreError, CoreResult};
use crate::types::LocalWorld;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lists local saves.
pub trait LocalWorldSource: Send + Sync {
    /// Returns the saves found, sorted by name.
    fn list(&self) -> CoreResult<Vec<LocalWorld>>;
}

/// A saves root where every sub-directory is one world.
#[derive(Debug, Clone)]
pub struct SavesDirectory {
    root: PathBuf,
}

impl SavesDirectory {
    /// Uses `root` as the saves directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Uses the game's default saves location for this OS.
    ///
    /// # Errors
    ///
    /// Fails if the home directory cannot be determined.
    pub fn platform_default() -> CoreResult<Self> {
        default_saves_dir().map(Self::new)
    }

    /// The saves root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LocalWorldSource for SavesDirectory {
    fn list(&self) -> CoreResult<Vec<LocalWorld>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(root = %self.root.display(), "saves directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(CoreError::scan_failed(&self.root, e)),
        };

        let mut worlds = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::scan_failed(&self.root, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| CoreError::scan_failed(entry.path(), e))?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            worlds.push(LocalWorld {
                name,
                path: entry.path(),
            });
        }
        worlds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(worlds)
    }
}

/// The per-OS default Minecraft saves directory.
///
/// The game keeps its data under the roaming application-data directory on
/// Windows, under Application Support on macOS and in `~/.minecraft`
/// elsewhere.
pub fn default_saves_dir() -> CoreResult<PathBuf> {
    let root = if cfg!(windows) {
        dirs::data_dir().map(|d| d.join(".minecraft"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir().map(|d| d.join("minecraft"))
    } else {
        dirs::home_dir().map(|d| d.join(".minecraft"))
    };
    root.map(|r| r.join("saves"))
        .ok_or_else(|| CoreError::discovery("could not determine the home directory"))
}
