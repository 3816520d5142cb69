//! Content-addressed directory snapshots.
//!
//! A [`Snapshot`] is a manifest mapping each relative file path to the
//! SHA-256 of its content and its size. The snapshot id is the hash of the
//! canonical CBOR encoding of that manifest, so two scans of an unchanged
//! directory always produce the same id regardless of when or where they
//! were taken.
//!
//! ```text
//! manifest := { version, entries: sorted map path -> (hash, size) }
//! id       := sha256(cbor(manifest))
//! ```
//!
//! Paths are stored with `/` separators so manifests compare equal across
//! platforms.

use crate::blob::BlobStore;
use crate::error::{CoreError, CoreResult};
use crate::types::{ContentHash, SnapshotId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current manifest encoding version.
pub const MANIFEST_VERSION: u16 = 1;

/// Files skipped by default: the game holds this lock while a world is open.
pub const DEFAULT_EXCLUDES: &[&str] = &["session.lock"];

const READ_BUF_SIZE: usize = 64 * 1024;
const TEMP_SUFFIX: &str = ".worldsync-tmp";

/// One file in a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Hash of the file content.
    pub hash: ContentHash,
    /// Size in bytes.
    pub size: u64,
}

/// Sorted mapping of relative path to content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    version: u16,
    entries: BTreeMap<String, ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: BTreeMap::new(),
        }
    }

    /// Inserts an entry, replacing any previous one at `path`.
    pub fn insert(&mut self, path: impl Into<String>, hash: ContentHash, size: u64) {
        self.entries.insert(path.into(), ManifestEntry { hash, size });
    }

    /// Looks up a path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    /// Iterates entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ManifestEntry)> {
        self.entries.iter().map(|(p, e)| (p.as_str(), e))
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the manifest has no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encodes to canonical CBOR.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let manifest: Manifest =
            ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }
}

/// An immutable, content-addressed view of a directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    id: SnapshotId,
    manifest: Manifest,
    encoded: Vec<u8>,
}

impl Snapshot {
    /// Wraps a manifest, computing its id.
    pub fn from_manifest(manifest: Manifest) -> CoreResult<Self> {
        let encoded = manifest.encode()?;
        Ok(Self {
            id: ContentHash::of(&encoded),
            manifest,
            encoded,
        })
    }

    /// Decodes a manifest blob and checks it against `expected`.
    pub fn from_encoded(expected: &SnapshotId, bytes: &[u8]) -> CoreResult<Self> {
        let actual = ContentHash::of(bytes);
        if &actual != expected {
            return Err(CoreError::BlobCorrupt {
                expected: *expected,
                actual,
            });
        }
        let manifest = Manifest::decode(bytes)?;
        Ok(Self {
            id: actual,
            manifest,
            encoded: bytes.to_vec(),
        })
    }

    /// An empty snapshot.
    pub fn empty() -> CoreResult<Self> {
        Self::from_manifest(Manifest::new())
    }

    /// The snapshot id (manifest hash).
    #[must_use]
    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    /// The manifest.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The encoded manifest; its hash is [`id`](Self::id).
    #[must_use]
    pub fn encoded_manifest(&self) -> &[u8] {
        &self.encoded
    }

    /// Unique blobs referenced by the manifest, with their sizes.
    #[must_use]
    pub fn blobs(&self) -> BTreeMap<ContentHash, u64> {
        self.manifest
            .entries
            .values()
            .map(|e| (e.hash, e.size))
            .collect()
    }

    /// True if any file in the manifest has this content.
    #[must_use]
    pub fn contains_blob(&self, hash: &ContentHash) -> bool {
        self.manifest.entries.values().any(|e| &e.hash == hash)
    }

    /// First path (in sort order) whose content is `hash`.
    #[must_use]
    pub fn path_for(&self, hash: &ContentHash) -> Option<&str> {
        self.manifest
            .entries
            .iter()
            .find(|(_, e)| &e.hash == hash)
            .map(|(p, _)| p.as_str())
    }

    /// Sum of the sizes of the unique blobs.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.blobs().values().sum()
    }
}

/// Walks a directory and produces a [`Snapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    excludes: BTreeSet<String>,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self {
            excludes: DEFAULT_EXCLUDES.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl SnapshotBuilder {
    /// Creates a builder with the default exclusions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file name to skip wherever it appears.
    #[must_use]
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.excludes.insert(name.into());
        self
    }

    /// Builds a snapshot of `root`. A missing or unreadable `root` is a
    /// scan failure.
    pub fn build(&self, root: &Path) -> CoreResult<Snapshot> {
        self.build_with_cancel(root, &|| false)
    }

    /// Builds a snapshot, checking `is_cancelled` between files.
    ///
    /// Nothing partial escapes: on error or cancellation the work so far
    /// is dropped.
    pub fn build_with_cancel(
        &self,
        root: &Path,
        is_cancelled: &dyn Fn() -> bool,
    ) -> CoreResult<Snapshot> {
        let meta = fs::metadata(root).map_err(|e| CoreError::scan_failed(root, e))?;
        if !meta.is_dir() {
            return Err(CoreError::scan_failed(
                root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let mut manifest = Manifest::new();
        self.walk(root, root, &mut manifest, is_cancelled)?;
        let snapshot = Snapshot::from_manifest(manifest)?;
        debug!(
            root = %root.display(),
            files = snapshot.manifest().len(),
            id = %snapshot.id().short(12),
            "built snapshot"
        );
        Ok(snapshot)
    }

    /// Like [`build`](Self::build) but treats a missing directory as empty.
    pub fn build_or_empty(&self, root: &Path) -> CoreResult<Snapshot> {
        if !root.exists() {
            return Snapshot::empty();
        }
        self.build(root)
    }

    fn walk(
        &self,
        root: &Path,
        dir: &Path,
        manifest: &mut Manifest,
        is_cancelled: &dyn Fn() -> bool,
    ) -> CoreResult<()> {
        let mut entries = fs::read_dir(dir)
            .map_err(|e| CoreError::scan_failed(dir, e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::scan_failed(dir, e))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            if is_cancelled() {
                return Err(CoreError::ScanCancelled);
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.excludes.contains(&name) || name.ends_with(TEMP_SUFFIX) {
                continue;
            }

            let file_type = entry
                .file_type()
                .map_err(|e| CoreError::scan_failed(&path, e))?;
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                self.walk(root, &path, manifest, is_cancelled)?;
            } else if file_type.is_file() {
                let (hash, size) = hash_file(&path)?;
                manifest.insert(relative_key(root, &path)?, hash, size);
            }
        }
        Ok(())
    }
}

/// Streams a file through SHA-256.
pub fn hash_file(path: &Path) -> CoreResult<(ContentHash, u64)> {
    let mut file = File::open(path).map_err(|e| CoreError::scan_failed(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut size = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| CoreError::scan_failed(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((ContentHash::from_hasher(hasher), size))
}

fn relative_key(root: &Path, path: &Path) -> CoreResult<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| CoreError::invalid_format(format!("{} escapes root", path.display())))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Resolves a manifest key under `root`, rejecting keys that escape it.
pub fn resolve_key(root: &Path, key: &str) -> CoreResult<PathBuf> {
    let mut out = root.to_path_buf();
    for part in key.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(CoreError::invalid_format(format!(
                "illegal manifest path: {key}"
            )));
        }
        out.push(part);
    }
    Ok(out)
}

/// Writes `target` into `dir`.
///
/// Blobs come from `blobs`; a blob missing there but present in `current`
/// (the last scan of `dir`) is staged from the local file first, before any
/// file is touched. Files listed in `current` but absent from `target` are
/// then removed, along with directories they leave empty. Each target file
/// is written to a temporary sibling and renamed into place; a file in the
/// way of a needed directory, or a directory in the way of a file, is
/// removed first.
pub fn materialize(
    target: &Snapshot,
    current: Option<&Snapshot>,
    blobs: &dyn BlobStore,
    dir: &Path,
) -> CoreResult<()> {
    fs::create_dir_all(dir)?;

    for (hash, _) in target.blobs() {
        if blobs.contains(&hash)? {
            continue;
        }
        let local = current
            .and_then(|c| c.path_for(&hash))
            .ok_or(CoreError::BlobNotFound(hash))?;
        let data = fs::read(resolve_key(dir, local)?)?;
        blobs.put(&hash, &data)?;
    }

    if let Some(current) = current {
        for (key, _) in current.manifest().iter() {
            if target.manifest().get(key).is_some() {
                continue;
            }
            let path = resolve_key(dir, key)?;
            remove_file_if_present(&path)?;
            remove_empty_parents(dir, &path);
        }
    }

    for (key, entry) in target.manifest().iter() {
        let path = resolve_key(dir, key)?;
        if let Some(cur) = current.and_then(|c| c.manifest().get(key)) {
            if cur.hash == entry.hash && path.is_file() {
                continue;
            }
        }
        make_room(dir, &path)?;
        let data = blobs.get(&entry.hash)?;
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(TEMP_SUFFIX);
        let tmp = PathBuf::from(tmp_name);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
    }
    Ok(())
}

fn remove_file_if_present(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes the directories above `path` that are now empty, stopping at
/// `root` or at the first one that still has entries.
fn remove_empty_parents(root: &Path, path: &Path) {
    let mut parent = path.parent();
    while let Some(d) = parent {
        if d == root || !d.starts_with(root) || fs::remove_dir(d).is_err() {
            break;
        }
        parent = d.parent();
    }
}

/// Clears the way for a regular file at `path` under `root`.
fn make_room(root: &Path, path: &Path) -> CoreResult<()> {
    let mut ancestor = path.parent();
    while let Some(a) = ancestor {
        if a == root || !a.starts_with(root) {
            break;
        }
        if let Ok(meta) = fs::symlink_metadata(a) {
            if !meta.is_dir() {
                debug!(path = %a.display(), "removing file in place of a directory");
                fs::remove_file(a)?;
            }
        }
        ancestor = a.parent();
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.is_dir() {
            debug!(path = %path.display(), "removing directory in place of a file");
            fs::remove_dir_all(path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn build_is_deterministic() {
        let dir = tempdir().unwrap();
        write(dir.path(), "level.dat", b"level");
        write(dir.path(), "region/r.0.0.mca", &[7u8; 5000]);
        write(dir.path(), "playerdata/abc.dat", b"player");

        let builder = SnapshotBuilder::new();
        let a = builder.build(dir.path()).unwrap();
        let b = builder.build(dir.path()).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.encoded_manifest(), b.encoded_manifest());
        assert_eq!(a.manifest().len(), 3);
        assert!(a.manifest().get("region/r.0.0.mca").is_some());
    }

    #[test]
    fn content_change_changes_id() {
        let dir = tempdir().unwrap();
        write(dir.path(), "level.dat", b"one");
        let before = SnapshotBuilder::new().build(dir.path()).unwrap();
        write(dir.path(), "level.dat", b"two");
        let after = SnapshotBuilder::new().build(dir.path()).unwrap();
        assert_ne!(before.id(), after.id());
    }

    #[test]
    fn session_lock_is_skipped() {
        let dir = tempdir().unwrap();
        write(dir.path(), "level.dat", b"x");
        let without = SnapshotBuilder::new().build(dir.path()).unwrap();
        write(dir.path(), "session.lock", b"lock");
        let with = SnapshotBuilder::new().build(dir.path()).unwrap();
        assert_eq!(without.id(), with.id());
    }

    #[test]
    fn missing_directory_is_scan_failure() {
        let dir = tempdir().unwrap();
        let err = SnapshotBuilder::new()
            .build(&dir.path().join("nope"))
            .unwrap_err();
        assert!(matches!(err, CoreError::ScanFailed { .. }));
        assert!(SnapshotBuilder::new()
            .build_or_empty(&dir.path().join("nope"))
            .unwrap()
            .manifest()
            .is_empty());
    }

    #[test]
    fn cancellation_discards_scan() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a", b"a");
        let err = SnapshotBuilder::new()
            .build_with_cancel(dir.path(), &|| true)
            .unwrap_err();
        assert!(matches!(err, CoreError::ScanCancelled));
    }

    #[test]
    fn duplicate_content_is_one_blob() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.dat", b"same");
        write(dir.path(), "b.dat", b"same");
        let snap = SnapshotBuilder::new().build(dir.path()).unwrap();
        assert_eq!(snap.blobs().len(), 1);
        assert_eq!(snap.total_bytes(), 4);
        assert_eq!(snap.path_for(&ContentHash::of(b"same")), Some("a.dat"));
    }

    #[test]
    fn encoded_manifest_roundtrips_with_id_check() {
        let dir = tempdir().unwrap();
        write(dir.path(), "level.dat", b"level");
        let snap = SnapshotBuilder::new().build(dir.path()).unwrap();
        let back = Snapshot::from_encoded(snap.id(), snap.encoded_manifest()).unwrap();
        assert_eq!(back, snap);

        let wrong = ContentHash::of(b"other");
        assert!(Snapshot::from_encoded(&wrong, snap.encoded_manifest()).is_err());
    }

    #[test]
    fn resolve_key_rejects_traversal() {
        let root = Path::new("/tmp/world");
        assert!(resolve_key(root, "../etc/passwd").is_err());
        assert!(resolve_key(root, "a//b").is_err());
        assert_eq!(
            resolve_key(root, "region/r.0.0.mca").unwrap(),
            root.join("region").join("r.0.0.mca")
        );
    }

    #[test]
    fn materialize_writes_and_prunes() {
        let src = tempdir().unwrap();
        write(src.path(), "level.dat", b"new level");
        write(src.path(), "region/r.0.0.mca", b"chunks");
        let target = SnapshotBuilder::new().build(src.path()).unwrap();

        let blobs = MemoryBlobStore::new();
        blobs.put(&ContentHash::of(b"new level"), b"new level").unwrap();

        let dst = tempdir().unwrap();
        write(dst.path(), "region/r.0.0.mca", b"chunks");
        write(dst.path(), "stale.dat", b"old");
        let current = SnapshotBuilder::new().build(dst.path()).unwrap();

        materialize(&target, Some(&current), &blobs, dst.path()).unwrap();

        let after = SnapshotBuilder::new().build(dst.path()).unwrap();
        assert_eq!(after.id(), target.id());
        assert!(!dst.path().join("stale.dat").exists());
    }

    #[test]
    fn materialize_replaces_file_with_directory() {
        let src = tempdir().unwrap();
        write(src.path(), "data/map.dat", b"map");
        write(src.path(), "level.dat", b"level");
        let target = SnapshotBuilder::new().build(src.path()).unwrap();

        let blobs = MemoryBlobStore::new();
        blobs.put(&ContentHash::of(b"map"), b"map").unwrap();

        let dst = tempdir().unwrap();
        write(dst.path(), "data", b"was a file");
        write(dst.path(), "level.dat", b"level");
        let current = SnapshotBuilder::new().build(dst.path()).unwrap();

        materialize(&target, Some(&current), &blobs, dst.path()).unwrap();

        assert_eq!(fs::read(dst.path().join("data/map.dat")).unwrap(), b"map");
        let after = SnapshotBuilder::new().build(dst.path()).unwrap();
        assert_eq!(after.id(), target.id());
    }

    #[test]
    fn materialize_replaces_directory_with_file() {
        let src = tempdir().unwrap();
        write(src.path(), "data", b"now a file");
        let target = SnapshotBuilder::new().build(src.path()).unwrap();

        let blobs = MemoryBlobStore::new();
        blobs.put(&ContentHash::of(b"now a file"), b"now a file").unwrap();

        let dst = tempdir().unwrap();
        write(dst.path(), "data/region/r.0.0.mca", b"chunks");
        write(dst.path(), "data/map.dat", b"map");
        // Untracked, so pruning alone leaves the directory behind.
        write(dst.path(), "data/session.lock", b"lock");
        let current = SnapshotBuilder::new().build(dst.path()).unwrap();

        materialize(&target, Some(&current), &blobs, dst.path()).unwrap();

        assert!(dst.path().join("data").is_file());
        assert_eq!(fs::read(dst.path().join("data")).unwrap(), b"now a file");
        let after = SnapshotBuilder::new().build(dst.path()).unwrap();
        assert_eq!(after.id(), target.id());
    }

    #[test]
    fn pruning_removes_emptied_directories() {
        let src = tempdir().unwrap();
        write(src.path(), "level.dat", b"level");
        let target = SnapshotBuilder::new().build(src.path()).unwrap();

        let dst = tempdir().unwrap();
        write(dst.path(), "level.dat", b"level");
        write(dst.path(), "DIM-1/region/r.0.0.mca", b"nether");
        let current = SnapshotBuilder::new().build(dst.path()).unwrap();

        materialize(&target, Some(&current), &MemoryBlobStore::new(), dst.path()).unwrap();
        assert!(!dst.path().join("DIM-1").exists());
        assert!(dst.path().join("level.dat").is_file());
    }

    #[test]
    fn materialize_without_blob_fails() {
        let src = tempdir().unwrap();
        write(src.path(), "level.dat", b"level");
        let target = SnapshotBuilder::new().build(src.path()).unwrap();
        let dst = tempdir().unwrap();
        let err = materialize(&target, None, &MemoryBlobStore::new(), dst.path()).unwrap_err();
        assert!(matches!(err, CoreError::BlobNotFound(_)));
    }
}
