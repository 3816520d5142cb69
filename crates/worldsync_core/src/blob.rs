//! Local content-addressed blob stores.
//!
//! Blob stores are opaque byte stores keyed by [`ContentHash`]. Every
//! `put` is verified against its key, so a store never holds a blob whose
//! content does not match its name.
//!
//! - [`MemoryBlobStore`] - For testing and ephemeral staging
//! - [`FsBlobStore`] - Objects under `<root>/ab/cdef...`, written atomically

use crate::error::{CoreError, CoreResult};
use crate::types::ContentHash;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A content-addressed byte store.
///
/// # Invariants
///
/// - `put(h, data)` fails unless `ContentHash::of(data) == h`
/// - `get(h)` returns exactly the bytes stored under `h`
/// - Storing the same blob twice is a no-op
pub trait BlobStore: Send + Sync {
    /// Returns true if the blob is present.
    fn contains(&self, hash: &ContentHash) -> CoreResult<bool>;

    /// Reads a blob.
    fn get(&self, hash: &ContentHash) -> CoreResult<Vec<u8>>;

    /// Stores a blob after verifying its hash.
    fn put(&self, hash: &ContentHash, data: &[u8]) -> CoreResult<()>;
}

fn verify(hash: &ContentHash, data: &[u8]) -> CoreResult<()> {
    let actual = ContentHash::of(data);
    if &actual != hash {
        return Err(CoreError::BlobCorrupt {
            expected: *hash,
            actual,
        });
    }
    Ok(())
}

/// An in-memory blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<ContentHash, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// True if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn contains(&self, hash: &ContentHash) -> CoreResult<bool> {
        Ok(self.blobs.read().contains_key(hash))
    }

    fn get(&self, hash: &ContentHash) -> CoreResult<Vec<u8>> {
        self.blobs
            .read()
            .get(hash)
            .cloned()
            .ok_or(CoreError::BlobNotFound(*hash))
    }

    fn put(&self, hash: &ContentHash, data: &[u8]) -> CoreResult<()> {
        verify(hash, data)?;
        self.blobs
            .write()
            .entry(*hash)
            .or_insert_with(|| data.to_vec());
        Ok(())
    }
}

/// A blob store backed by a directory.
///
/// ```text
/// <root>/
/// ├─ 3f/
/// │  └─ a2c9...   # remaining 62 hex chars
/// └─ tmp/         # in-progress writes
/// ```
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Opens or creates a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }
}

impl BlobStore for FsBlobStore {
    fn contains(&self, hash: &ContentHash) -> CoreResult<bool> {
        Ok(self.object_path(hash).is_file())
    }

    fn get(&self, hash: &ContentHash) -> CoreResult<Vec<u8>> {
        let data = match fs::read(self.object_path(hash)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::BlobNotFound(*hash))
            }
            Err(e) => return Err(e.into()),
        };
        verify(hash, &data)?;
        Ok(data)
    }

    fn put(&self, hash: &ContentHash, data: &[u8]) -> CoreResult<()> {
        verify(hash, data)?;
        let path = self.object_path(hash);
        if path.is_file() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self
            .root
            .join("tmp")
            .join(format!("{}.{}", hash.to_hex(), uuid::Uuid::new_v4().simple()));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(store: &dyn BlobStore) {
        let data = b"region data".to_vec();
        let hash = ContentHash::of(&data);
        assert!(!store.contains(&hash).unwrap());
        assert!(matches!(store.get(&hash), Err(CoreError::BlobNotFound(_))));

        store.put(&hash, &data).unwrap();
        store.put(&hash, &data).unwrap();
        assert!(store.contains(&hash).unwrap());
        assert_eq!(store.get(&hash).unwrap(), data);
    }

    #[test]
    fn memory_store_basics() {
        let store = MemoryBlobStore::new();
        exercise(&store);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn fs_store_basics() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("objects")).unwrap();
        exercise(&store);
    }

    #[test]
    fn put_rejects_mismatched_hash() {
        let store = MemoryBlobStore::new();
        let wrong = ContentHash::of(b"something else");
        let err = store.put(&wrong, b"data").unwrap_err();
        assert!(matches!(err, CoreError::BlobCorrupt { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn fs_store_detects_corruption_on_read() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        let hash = ContentHash::of(b"good");
        store.put(&hash, b"good").unwrap();
        fs::write(store.object_path(&hash), b"bad!").unwrap();
        assert!(matches!(
            store.get(&hash),
            Err(CoreError::BlobCorrupt { .. })
        ));
    }
}
