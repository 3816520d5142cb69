//! Save-directory fixtures.
//!
//! Provides throwaway world directories laid out like a real save, so
//! snapshot and sync tests exercise nested paths, binary content and the
//! `session.lock` exclusion.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A world directory with automatic cleanup.
pub struct TempWorld {
    name: String,
    path: PathBuf,
    _temp_dir: TempDir,
}

impl TempWorld {
    /// Creates an empty world directory named `name`.
    pub fn empty(name: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join(name);
        fs::create_dir_all(&path).expect("Failed to create world directory");
        Self {
            name: name.to_string(),
            path,
            _temp_dir: temp_dir,
        }
    }

    /// Creates a world with a level file, two region files, a player file
    /// and a live `session.lock`.
    pub fn sample(name: &str) -> Self {
        let world = Self::empty(name);
        world.write("level.dat", &level_dat(name));
        world.write("region/r.0.0.mca", &region_bytes(0, 4096));
        world.write("region/r.0.-1.mca", &region_bytes(1, 4096));
        world.write("playerdata/steve.dat", b"player:steve;hp=20");
        world.write("session.lock", &[0xe2, 0x98, 0x83]);
        world
    }

    /// The world's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The world directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a file relative to the world root, creating parents.
    pub fn write(&self, rel: &str, data: &[u8]) {
        let path = self.path.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        fs::write(path, data).expect("Failed to write world file");
    }

    /// Reads a file relative to the world root.
    pub fn read(&self, rel: &str) -> Vec<u8> {
        fs::read(self.path.join(rel)).expect("Failed to read world file")
    }

    /// True if a file exists relative to the world root.
    pub fn exists(&self, rel: &str) -> bool {
        self.path.join(rel).exists()
    }

    /// Removes a file relative to the world root.
    pub fn remove(&self, rel: &str) {
        fs::remove_file(self.path.join(rel)).expect("Failed to remove world file");
    }

    /// Simulates playing: rewrites the level file with a new tick count.
    pub fn play(&self, ticks: u64) {
        let mut data = level_dat(&self.name);
        data.extend_from_slice(&ticks.to_le_bytes());
        self.write("level.dat", &data);
    }
}

/// Contents of a fake `level.dat`.
pub fn level_dat(name: &str) -> Vec<u8> {
    let mut data = b"\x0a\x00\x00LevelName:".to_vec();
    data.extend_from_slice(name.as_bytes());
    data
}

/// Deterministic pseudo-random bytes standing in for a region file.
pub fn region_bytes(seed: u8, len: usize) -> Vec<u8> {
    let mut state = u32::from(seed).wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xff) as u8
        })
        .collect()
}

/// Runs `f` with a sample world.
pub fn with_sample_world<F, R>(name: &str, f: F) -> R
where
    F: FnOnce(&TempWorld) -> R,
{
    let world = TempWorld::sample(name);
    f(&world)
}
