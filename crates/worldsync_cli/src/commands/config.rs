//! Config command implementation.

use std::path::Path;
use tracing::info;
use worldsync_core::{AppConfig, ConfigStore, EncryptedConfigStore};

/// Fields to change; `None` leaves a field as it is.
#[derive(Debug, Default)]
pub struct Changes {
    /// New display name.
    pub username: Option<String>,
    /// New avatar id.
    pub avatar_id: Option<String>,
    /// New remote client id.
    pub client_id: Option<String>,
    /// New remote client secret.
    pub client_secret: Option<String>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.avatar_id.is_none()
            && self.client_id.is_none()
            && self.client_secret.is_none()
    }

    fn apply(self, config: &mut AppConfig) {
        if let Some(v) = self.username {
            config.username = v;
        }
        if let Some(v) = self.avatar_id {
            config.avatar_id = v;
        }
        if let Some(v) = self.client_id {
            config.client_id = v;
        }
        if let Some(v) = self.client_secret {
            config.client_secret = v;
        }
    }
}

/// Prints the stored profile with the secret masked.
pub fn show(state_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = EncryptedConfigStore::open(state_dir)?;
    match store.load()? {
        Some(config) => {
            println!("username:      {}", config.username);
            println!("avatarId:      {}", config.avatar_id);
            println!("clientId:      {}", config.client_id);
            println!("clientSecret:  {}", mask(&config.client_secret));
        }
        None => println!("No profile stored in {}", state_dir.display()),
    }
    Ok(())
}

/// Updates the stored profile.
pub fn set(state_dir: &Path, changes: Changes) -> Result<(), Box<dyn std::error::Error>> {
    if changes.is_empty() {
        return Err("nothing to change; pass at least one field".into());
    }
    let store = EncryptedConfigStore::open(state_dir)?;
    let mut config = store.load()?.unwrap_or_default();
    changes.apply(&mut config);
    store.save(&config)?;
    info!(path = %store.path().display(), "profile saved");
    println!("Profile saved");
    Ok(())
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "********".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_merges_with_stored_profile() {
        let dir = tempfile::tempdir().unwrap();
        set(
            dir.path(),
            Changes {
                username: Some("Steve".into()),
                client_secret: Some("hunter2".into()),
                ..Changes::default()
            },
        )
        .unwrap();
        set(
            dir.path(),
            Changes {
                avatar_id: Some("creeper".into()),
                ..Changes::default()
            },
        )
        .unwrap();

        let config = EncryptedConfigStore::open(dir.path())
            .unwrap()
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(config.username, "Steve");
        assert_eq!(config.avatar_id, "creeper");
        assert_eq!(config.client_secret, "hunter2");
        show(dir.path()).unwrap();
    }

    #[test]
    fn empty_change_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(set(dir.path(), Changes::default()).is_err());
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask(""), "");
        assert_eq!(mask("hunter2"), "********");
    }
}
