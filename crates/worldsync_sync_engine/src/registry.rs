//! Observable registry of tracked worlds.
//!
//! The registry holds one [`WorldRecord`] per world. Readers get clones;
//! only the engine mutates records. Every mutation is published to
//! subscribers after the write lock is released.
//!
//! # Usage
//!
//! ```rust,ignore
//! let events = engine.registry().subscribe();
//! std::thread::spawn(move || {
//!     while let Ok(event) = events.recv() {
//!         println!("{event:?}");
//!     }
//! });
//! ```

use crate::error::Failure;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use worldsync_core::{Author, CommitId, WorldId};

/// Status shown for a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorldStatus {
    /// Nothing running.
    Idle,
    /// Scanning the local directory.
    Scanning,
    /// Uploading; progress is set.
    Uploading,
    /// Downloading; progress is set.
    Downloading,
    /// Local and remote agree.
    Synced,
    /// The last job failed; see the record's failure.
    Error,
}

impl WorldStatus {
    /// True for statuses that carry progress.
    pub fn has_progress(&self) -> bool {
        matches!(self, WorldStatus::Uploading | WorldStatus::Downloading)
    }
}

impl fmt::Display for WorldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorldStatus::Idle => "idle",
            WorldStatus::Scanning => "scanning",
            WorldStatus::Uploading => "uploading",
            WorldStatus::Downloading => "downloading",
            WorldStatus::Synced => "synced",
            WorldStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// The observable state of one world.
///
/// Progress is present exactly while the status is uploading or
/// downloading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldRecord {
    id: WorldId,
    name: String,
    local_path: Option<PathBuf>,
    is_hosted: bool,
    host: Option<Author>,
    status: WorldStatus,
    progress: Option<u8>,
    commits: Vec<CommitId>,
    last_failure: Option<Failure>,
}

impl WorldRecord {
    /// A world backed by a local save directory.
    pub fn local(id: WorldId, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            local_path: Some(path.into()),
            is_hosted: false,
            host: None,
            status: WorldStatus::Idle,
            progress: None,
            commits: Vec::new(),
            last_failure: None,
        }
    }

    /// A world hosted by another user, not materialized locally yet.
    pub fn hosted(id: WorldId, name: impl Into<String>, host: Author) -> Self {
        Self {
            id,
            name: name.into(),
            local_path: None,
            is_hosted: true,
            host: Some(host),
            status: WorldStatus::Idle,
            progress: None,
            commits: Vec::new(),
            last_failure: None,
        }
    }

    /// Stable id.
    pub fn id(&self) -> &WorldId {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local save directory, if any.
    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    /// True for worlds hosted by another user.
    pub fn is_hosted(&self) -> bool {
        self.is_hosted
    }

    /// The hosting user.
    pub fn host(&self) -> Option<&Author> {
        self.host.as_ref()
    }

    /// Current status.
    pub fn status(&self) -> WorldStatus {
        self.status
    }

    /// Transfer progress, 0 to 100.
    pub fn progress(&self) -> Option<u8> {
        self.progress
    }

    /// Commit ids, most recent first.
    pub fn commits(&self) -> &[CommitId] {
        &self.commits
    }

    /// Why the world is in `Error`.
    pub fn last_failure(&self) -> Option<&Failure> {
        self.last_failure.as_ref()
    }

    pub(crate) fn set_status(&mut self, status: WorldStatus) {
        if status.has_progress() {
            if !self.status.has_progress() {
                self.progress = Some(0);
            }
        } else {
            self.progress = None;
        }
        if status != WorldStatus::Error {
            self.last_failure = None;
        }
        self.status = status;
    }

    pub(crate) fn set_progress(&mut self, percent: u8) {
        if self.status.has_progress() {
            self.progress = Some(percent.min(100));
        }
    }

    pub(crate) fn fail(&mut self, failure: Failure) {
        self.set_status(WorldStatus::Error);
        self.last_failure = Some(failure);
    }

    pub(crate) fn set_commits(&mut self, commits: Vec<CommitId>) {
        self.commits = commits;
    }

    pub(crate) fn set_local_path(&mut self, path: PathBuf) {
        self.local_path = Some(path);
    }
}

/// An event published on every registry change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A record was inserted or changed; carries the new value.
    Updated(WorldRecord),
    /// A world was unlinked.
    Removed(WorldId),
}

/// Registry of tracked worlds.
#[derive(Default)]
pub struct WorldRegistry {
    worlds: RwLock<BTreeMap<WorldId, WorldRecord>>,
    subscribers: RwLock<Vec<Sender<RegistryEvent>>>,
}

impl WorldRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a record.
    pub fn get(&self, id: &WorldId) -> Option<WorldRecord> {
        self.worlds.read().get(id).cloned()
    }

    /// Returns all records, ordered by id.
    pub fn list(&self) -> Vec<WorldRecord> {
        self.worlds.read().values().cloned().collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.worlds.read().len()
    }

    /// True if no worlds are tracked.
    pub fn is_empty(&self) -> bool {
        self.worlds.read().is_empty()
    }

    /// Subscribes to changes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<RegistryEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    pub(crate) fn insert(&self, record: WorldRecord) {
        self.worlds.write().insert(record.id, record.clone());
        self.publish(RegistryEvent::Updated(record));
    }

    pub(crate) fn remove(&self, id: &WorldId) -> Option<WorldRecord> {
        let removed = self.worlds.write().remove(id);
        if removed.is_some() {
            self.publish(RegistryEvent::Removed(*id));
        }
        removed
    }

    /// Applies `f` to a record and publishes the result if it changed.
    pub(crate) fn update<F>(&self, id: &WorldId, f: F) -> Option<WorldRecord>
    where
        F: FnOnce(&mut WorldRecord),
    {
        let (changed, record) = {
            let mut worlds = self.worlds.write();
            let record = worlds.get_mut(id)?;
            let before = record.clone();
            f(record);
            (before != *record, record.clone())
        };
        if changed {
            self.publish(RegistryEvent::Updated(record.clone()));
        }
        Some(record)
    }

    fn publish(&self, event: RegistryEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl fmt::Debug for WorldRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldRegistry")
            .field("worlds", &self.worlds.read().len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;

    fn record() -> WorldRecord {
        WorldRecord::local(WorldId::new(), "Survival", "/saves/Survival")
    }

    #[test]
    fn progress_only_while_transferring() {
        let mut r = record();
        r.set_progress(50);
        assert_eq!(r.progress(), None);

        r.set_status(WorldStatus::Uploading);
        assert_eq!(r.progress(), Some(0));
        r.set_progress(42);
        assert_eq!(r.progress(), Some(42));

        r.set_status(WorldStatus::Synced);
        assert_eq!(r.progress(), None);
    }

    #[test]
    fn failure_cleared_on_next_status() {
        let mut r = record();
        r.fail(Failure::new(FailureReason::Conflict, "diverged"));
        assert_eq!(r.status(), WorldStatus::Error);
        assert!(r.last_failure().unwrap().is_conflict());
        r.set_status(WorldStatus::Idle);
        assert!(r.last_failure().is_none());
    }

    #[test]
    fn subscribers_see_updates() {
        let registry = WorldRegistry::new();
        let events = registry.subscribe();
        let r = record();
        let id = *r.id();
        registry.insert(r);
        registry.update(&id, |r| r.set_status(WorldStatus::Scanning));
        // No change, no event.
        registry.update(&id, |r| r.set_status(WorldStatus::Scanning));
        registry.remove(&id);

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(received.len(), 3);
        assert!(matches!(&received[1], RegistryEvent::Updated(r) if r.status() == WorldStatus::Scanning));
        assert_eq!(received[2], RegistryEvent::Removed(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let registry = WorldRegistry::new();
        drop(registry.subscribe());
        registry.insert(record());
        assert_eq!(registry.subscribers.read().len(), 0);
    }

    #[test]
    fn hosted_world_has_no_path() {
        let r = WorldRecord::hosted(WorldId::new(), "Shared", Author::new("u2", "Alex"));
        assert!(r.is_hosted());
        assert!(r.local_path().is_none());
        assert_eq!(r.host().unwrap().name, "Alex");
    }
}
