//! Append-only, per-world commit log.
//!
//! Each world's history is a sequence of commits in landing order. Appends
//! are compare-and-set against the head the caller observed: if another
//! commit landed in between, the append fails with
//! [`CoreError::ConcurrentModification`] and nothing changes.
//!
//! On disk the store is a directory:
//!
//! ```text
//! <store>/
//! ├─ LOCK                 # Advisory lock for single-writer
//! └─ <world-id>.log       # One record per commit, oldest first
//! ```
//!
//! Record layout: `magic (4) || len u32 LE || cbor(commit) || checksum (4)`,
//! where the checksum is the first four bytes of SHA-256 over the payload.
//! A torn or corrupt tail left by a crash is truncated on open.

use crate::commit::Commit;
use crate::error::{CoreError, CoreResult};
use crate::snapshot::Snapshot;
use crate::types::{now_millis, Author, CommitId, ContentHash, WorldId};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Magic bytes identifying a commit record.
pub const RECORD_MAGIC: [u8; 4] = *b"WSCM";

const LOCK_FILE: &str = "LOCK";
const LOG_EXT: &str = "log";
const HEADER_LEN: usize = 8;
const CHECKSUM_LEN: usize = 4;

/// Append-only commit log keyed by world.
///
/// Appends for one world are serialized by a per-world lock; appends for
/// different worlds do not contend.
pub struct CommitStore {
    dir: Option<StoreDir>,
    worlds: RwLock<HashMap<WorldId, Arc<Mutex<WorldLog>>>>,
}

struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

#[derive(Default)]
struct WorldLog {
    /// Oldest first.
    commits: Vec<Commit>,
    ids: HashSet<CommitId>,
    file: Option<File>,
    len: u64,
}

impl WorldLog {
    fn head(&self) -> Option<&Commit> {
        self.commits.last()
    }
}

impl CommitStore {
    /// Creates a store that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            worlds: RwLock::new(HashMap::new()),
        }
    }

    /// Opens or creates a store directory, taking an exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreLocked`] if another process holds the lock.
    pub fn open(path: &Path) -> CoreResult<Self> {
        fs::create_dir_all(path)?;
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked);
        }

        let mut worlds = HashMap::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_path = entry.path();
            if file_path.extension().and_then(|e| e.to_str()) != Some(LOG_EXT) {
                continue;
            }
            let Some(world_id) = file_path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<WorldId>().ok())
            else {
                warn!(file = %file_path.display(), "ignoring unrecognised log file");
                continue;
            };
            let log = load_log(&file_path)?;
            debug!(world = %world_id, commits = log.commits.len(), "loaded commit log");
            worlds.insert(world_id, Arc::new(Mutex::new(log)));
        }

        Ok(Self {
            dir: Some(StoreDir {
                path: path.to_path_buf(),
                _lock_file: lock_file,
            }),
            worlds: RwLock::new(worlds),
        })
    }

    fn world(&self, world_id: &WorldId) -> Arc<Mutex<WorldLog>> {
        if let Some(log) = self.worlds.read().get(world_id) {
            return Arc::clone(log);
        }
        Arc::clone(self.worlds.write().entry(*world_id).or_default())
    }

    /// Creates a commit of `snapshot` on top of `expected_head` and appends it.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConcurrentModification`] if the head is no longer
    /// `expected_head`.
    pub fn append(
        &self,
        world_id: &WorldId,
        expected_head: Option<&CommitId>,
        snapshot: &Snapshot,
        author: Author,
        message: &str,
    ) -> CoreResult<Commit> {
        let log = self.world(world_id);
        let mut log = log.lock();
        check_head(&log, expected_head)?;
        let commit = Commit::new(log.head(), *snapshot.id(), author, message, now_millis())?;
        self.write_locked(world_id, &mut log, commit.clone())?;
        Ok(commit)
    }

    /// Appends a commit that was created elsewhere, e.g. pulled from a remote.
    ///
    /// The commit's parent need not be the current head (a forced pull
    /// adopts another lineage); landing order is still strictly appended.
    pub fn append_commit(
        &self,
        world_id: &WorldId,
        expected_head: Option<&CommitId>,
        commit: Commit,
    ) -> CoreResult<()> {
        commit.verify()?;
        let log = self.world(world_id);
        let mut log = log.lock();
        check_head(&log, expected_head)?;
        self.write_locked(world_id, &mut log, commit)
    }

    /// Appends commits created elsewhere, oldest first, as one
    /// compare-and-set against `expected_head`.
    ///
    /// Every commit is verified and checked for duplicates before anything
    /// is written, so a rejected batch leaves the log unchanged.
    pub fn append_commits(
        &self,
        world_id: &WorldId,
        expected_head: Option<&CommitId>,
        commits: Vec<Commit>,
    ) -> CoreResult<()> {
        let mut batch = HashSet::with_capacity(commits.len());
        for commit in &commits {
            commit.verify()?;
            if !batch.insert(*commit.id()) {
                return Err(CoreError::DuplicateCommit(*commit.id()));
            }
        }
        let log = self.world(world_id);
        let mut log = log.lock();
        check_head(&log, expected_head)?;
        if let Some(dup) = commits.iter().find(|c| log.ids.contains(c.id())) {
            return Err(CoreError::DuplicateCommit(*dup.id()));
        }
        for commit in commits {
            self.write_locked(world_id, &mut log, commit)?;
        }
        Ok(())
    }

    fn write_locked(&self, world_id: &WorldId, log: &mut WorldLog, commit: Commit) -> CoreResult<()> {
        if log.ids.contains(commit.id()) {
            return Err(CoreError::DuplicateCommit(*commit.id()));
        }

        if let Some(dir) = &self.dir {
            let record = encode_record(&commit)?;
            if log.file.is_none() {
                let path = dir.path.join(format!("{world_id}.{LOG_EXT}"));
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .read(true)
                    .open(path)?;
                log.len = file.metadata()?.len();
                log.file = Some(file);
            }
            let prior_len = log.len;
            if let Some(file) = log.file.as_mut() {
                let written = file.write_all(&record).and_then(|()| file.sync_data());
                if let Err(e) = written {
                    // Leave the log exactly as before.
                    let _ = file.set_len(prior_len);
                    return Err(e.into());
                }
            }
            log.len = prior_len + record.len() as u64;
        }

        debug!(
            world = %world_id,
            commit = %commit.id().short(),
            height = commit.height(),
            "appended commit"
        );
        log.ids.insert(*commit.id());
        log.commits.push(commit);
        Ok(())
    }

    /// The world's history, most recent first.
    #[must_use]
    pub fn history(&self, world_id: &WorldId) -> Vec<Commit> {
        match self.worlds.read().get(world_id) {
            Some(log) => log.lock().commits.iter().rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// The most recently appended commit.
    #[must_use]
    pub fn head(&self, world_id: &WorldId) -> Option<Commit> {
        self.worlds
            .read()
            .get(world_id)
            .and_then(|log| log.lock().head().cloned())
    }

    /// Looks up a commit by id.
    #[must_use]
    pub fn get(&self, world_id: &WorldId, commit_id: &CommitId) -> Option<Commit> {
        let worlds = self.worlds.read();
        let log = worlds.get(world_id)?.lock();
        if !log.ids.contains(commit_id) {
            return None;
        }
        log.commits.iter().find(|c| c.id() == commit_id).cloned()
    }

    /// Number of commits recorded for a world.
    #[must_use]
    pub fn len(&self, world_id: &WorldId) -> usize {
        self.worlds
            .read()
            .get(world_id)
            .map_or(0, |log| log.lock().commits.len())
    }

    /// Worlds with at least one commit.
    #[must_use]
    pub fn worlds(&self) -> Vec<WorldId> {
        self.worlds
            .read()
            .iter()
            .filter(|(_, log)| !log.lock().commits.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }
}

impl std::fmt::Debug for CommitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitStore")
            .field("path", &self.dir.as_ref().map(|d| &d.path))
            .field("worlds", &self.worlds.read().len())
            .finish()
    }
}

fn check_head(log: &WorldLog, expected: Option<&CommitId>) -> CoreResult<()> {
    let actual = log.head().map(|c| *c.id());
    if actual.as_ref() != expected {
        return Err(CoreError::ConcurrentModification {
            expected: expected.copied(),
            actual,
        });
    }
    Ok(())
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = ContentHash::of(payload);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest.as_bytes()[..CHECKSUM_LEN]);
    out
}

fn encode_record(commit: &Commit) -> CoreResult<Vec<u8>> {
    let payload = commit.encode()?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_format("commit record too large"))?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    buf.extend_from_slice(&RECORD_MAGIC);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&checksum(&payload));
    Ok(buf)
}

/// Parses one record at the start of `data`. Returns the commit and the
/// number of bytes consumed, or `None` for a torn or corrupt record.
fn decode_record(data: &[u8]) -> Option<(Commit, usize)> {
    if data.len() < HEADER_LEN || data[..4] != RECORD_MAGIC {
        return None;
    }
    let len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let end = HEADER_LEN.checked_add(len)?.checked_add(CHECKSUM_LEN)?;
    if data.len() < end {
        return None;
    }
    let payload = &data[HEADER_LEN..HEADER_LEN + len];
    if checksum(payload) != data[HEADER_LEN + len..end] {
        return None;
    }
    Commit::decode(payload).ok().map(|c| (c, end))
}

fn load_log(path: &Path) -> CoreResult<WorldLog> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut log = WorldLog::default();
    let mut offset = 0usize;
    while offset < data.len() {
        match decode_record(&data[offset..]) {
            Some((commit, used)) => {
                log.ids.insert(*commit.id());
                log.commits.push(commit);
                offset += used;
            }
            None => {
                warn!(
                    file = %path.display(),
                    offset,
                    dropped = data.len() - offset,
                    "truncating torn commit log tail"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(offset as u64)?;
                file.sync_all()?;
                break;
            }
        }
    }
    log.len = offset as u64;
    Ok(log)
}
