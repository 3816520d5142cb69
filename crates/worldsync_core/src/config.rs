//! User profile and remote credential persistence.
//!
//! The profile is stored as JSON, encrypted with AES-256-GCM, in a dotfile
//! inside the application config directory:
//!
//! ```text
//! <config_dir>/
//! ├─ .secrets.dat   # nonce || ciphertext || tag
//! └─ .key           # 32 random bytes, created on first use
//! ```

use crate::crypto::{CryptoManager, EncryptionKey, KEY_SIZE};
use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SECRETS_FILE: &str = ".secrets.dat";
const KEY_FILE: &str = ".key";

/// The user profile and remote-store API credentials.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Display name used as commit author.
    pub username: String,
    /// Avatar chosen in the profile screen.
    pub avatar_id: String,
    /// OAuth client id for the remote store.
    pub client_id: String,
    /// OAuth client secret for the remote store.
    pub client_secret: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("username", &self.username)
            .field("avatar_id", &self.avatar_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Loads and saves the [`AppConfig`].
pub trait ConfigStore: Send + Sync {
    /// Returns the saved config, or `None` if nothing was saved yet.
    fn load(&self) -> CoreResult<Option<AppConfig>>;

    /// Persists the config, replacing any previous one.
    fn save(&self, config: &AppConfig) -> CoreResult<()>;
}

/// A config store that keeps the profile in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: RwLock<Option<AppConfig>>,
}

impl MemoryConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> CoreResult<Option<AppConfig>> {
        Ok(self.config.read().clone())
    }

    fn save(&self, config: &AppConfig) -> CoreResult<()> {
        *self.config.write() = Some(config.clone());
        Ok(())
    }
}

/// A config store writing an encrypted file.
pub struct EncryptedConfigStore {
    dir: PathBuf,
    crypto: CryptoManager,
}

impl EncryptedConfigStore {
    /// Creates a store in `dir` using `key`.
    pub fn new(dir: impl Into<PathBuf>, key: &EncryptionKey) -> Self {
        Self {
            dir: dir.into(),
            crypto: CryptoManager::new(key),
        }
    }

    /// Creates a store in `dir`, reading the key from `dir/.key` and
    /// generating it on first use.
    pub fn open(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let dir = dir.into();
        let key = load_or_create_key(&dir.join(KEY_FILE))?;
        Ok(Self::new(dir, &key))
    }

    /// Path of the encrypted file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(SECRETS_FILE)
    }
}

impl std::fmt::Debug for EncryptedConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedConfigStore")
            .field("dir", &self.dir)
            .finish()
    }
}

impl ConfigStore for EncryptedConfigStore {
    fn load(&self) -> CoreResult<Option<AppConfig>> {
        let path = self.path();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let json = self.crypto.decrypt(&data)?;
        let config =
            serde_json::from_slice(&json).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(Some(config))
    }

    fn save(&self, config: &AppConfig) -> CoreResult<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec(config).map_err(|e| CoreError::codec(e.to_string()))?;
        let encrypted = self.crypto.encrypt(&json)?;
        let tmp = self.dir.join(format!("{SECRETS_FILE}.tmp"));
        fs::write(&tmp, encrypted)?;
        fs::rename(&tmp, self.path())?;
        debug!(path = %self.path().display(), "saved config");
        Ok(())
    }
}

/// Reads a raw key file, creating it with a random key if missing.
pub fn load_or_create_key(path: &Path) -> CoreResult<EncryptionKey> {
    match fs::read(path) {
        Ok(bytes) => EncryptionKey::from_bytes(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let key = EncryptionKey::generate();
            fs::write(path, key.as_bytes())?;
            restrict_permissions(path)?;
            debug_assert_eq!(key.as_bytes().len(), KEY_SIZE);
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> CoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> CoreResult<()> {
    Ok(())
}
