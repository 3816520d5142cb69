//! CLI command implementations.

pub mod config;
pub mod history;
pub mod snapshot;
pub mod sync;
pub mod worlds;

use std::path::{Path, PathBuf};
use worldsync_core::{AppConfig, Author, ConfigStore, EncryptedConfigStore, LocalWorld};

const STATE_DIR_NAME: &str = "worldsync";
const DEFAULT_AUTHOR: &str = "worldsync";

/// `worldsync` under the user's config directory, falling back to
/// `~/.worldsync` and then to `./.worldsync`.
pub fn default_state_dir() -> PathBuf {
    if let Some(config) = dirs::config_dir() {
        return config.join(STATE_DIR_NAME);
    }
    let hidden = format!(".{STATE_DIR_NAME}");
    match dirs::home_dir() {
        Some(home) => home.join(hidden),
        None => PathBuf::from(hidden),
    }
}

/// The stored profile, or an empty one.
pub fn load_profile(state_dir: &Path) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let store = EncryptedConfigStore::open(state_dir)?;
    Ok(store.load()?.unwrap_or_default())
}

/// Commit author derived from the profile.
pub fn author(profile: &AppConfig) -> Author {
    if profile.username.is_empty() {
        Author::new(DEFAULT_AUTHOR, DEFAULT_AUTHOR)
    } else {
        Author::new(profile.username.clone(), profile.username.clone())
    }
}

/// A save directory named after its last path component.
pub fn local_world(path: &Path) -> Result<LocalWorld, Box<dyn std::error::Error>> {
    let path = std::path::absolute(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("{} does not name a save directory", path.display()))?;
    Ok(LocalWorld { name, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_name_is_last_component() {
        let world = local_world(Path::new("/saves/New World")).unwrap();
        assert_eq!(world.name, "New World");
        assert!(world.path.is_absolute());
    }

    #[test]
    fn default_state_dir_is_named_for_the_app() {
        let dir = default_state_dir();
        let name = dir.file_name().unwrap().to_string_lossy();
        assert!(name == "worldsync" || name == ".worldsync", "{}", dir.display());
    }

    #[test]
    fn root_is_not_a_world() {
        assert!(local_world(Path::new("/")).is_err());
    }

    #[test]
    fn anonymous_author_without_profile() {
        assert_eq!(author(&AppConfig::default()).name, DEFAULT_AUTHOR);
        let profile = AppConfig {
            username: "Steve".into(),
            ..AppConfig::default()
        };
        assert_eq!(author(&profile).name, "Steve");
    }
}
