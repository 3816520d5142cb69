//! Conflict resolution between local and remote histories.
//!
//! Histories are linear: every commit names at most one parent. Comparing
//! two heads therefore reduces to asking whether one is an ancestor of the
//! other. No merge is ever attempted; a [`Verdict::Diverged`] outcome is
//! handed back to the user, who picks a side.

use crate::commit::Commit;
use crate::types::{CommitId, WorldId};
use std::collections::HashMap;
use tracing::debug;

/// Outcome of comparing a local head with a remote head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Local extends remote; the remote can be fast-forwarded by a push.
    FastForwardPush,
    /// Remote extends local; the local side can be fast-forwarded by a pull.
    FastForwardPull,
    /// Both heads are the same commit (or both sides are empty).
    UpToDate,
    /// Neither head is an ancestor of the other.
    Diverged,
}

impl Verdict {
    /// True if the histories can be reconciled without user input.
    pub fn is_fast_forward(&self) -> bool {
        !matches!(self, Verdict::Diverged)
    }
}

/// Lookup of commits by id, used to walk parent links.
pub trait Lineage {
    /// Returns the commit with this id, if known.
    fn commit(&self, id: &CommitId) -> Option<&Commit>;
}

/// A lineage built from any number of commit lists.
#[derive(Debug, Default, Clone)]
pub struct CommitIndex {
    commits: HashMap<CommitId, Commit>,
}

impl CommitIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds commits to the index.
    pub fn extend<'a>(&mut self, commits: impl IntoIterator<Item = &'a Commit>) {
        for commit in commits {
            self.commits.entry(*commit.id()).or_insert_with(|| commit.clone());
        }
    }

    /// Builds an index from local and remote histories.
    #[must_use]
    pub fn from_histories(local: &[Commit], remote: &[Commit]) -> Self {
        let mut index = Self::new();
        index.extend(local);
        index.extend(remote);
        index
    }

    /// Commits reachable from `head` by parent links, head first.
    #[must_use]
    pub fn ancestry(&self, head: &CommitId) -> Vec<&Commit> {
        let mut out = Vec::new();
        let mut cursor = self.commits.get(head);
        while let Some(commit) = cursor {
            out.push(commit);
            cursor = commit.parent().and_then(|p| self.commits.get(p));
        }
        out
    }
}

impl Lineage for CommitIndex {
    fn commit(&self, id: &CommitId) -> Option<&Commit> {
        self.commits.get(id)
    }
}

/// Compares commit lineages.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Decides how `local_head` and `remote_head` relate.
    pub fn resolve(
        &self,
        world_id: &WorldId,
        local_head: Option<&Commit>,
        remote_head: Option<&Commit>,
        lineage: &dyn Lineage,
    ) -> Verdict {
        let verdict = match (local_head, remote_head) {
            (None, None) => Verdict::UpToDate,
            (Some(_), None) => Verdict::FastForwardPush,
            (None, Some(_)) => Verdict::FastForwardPull,
            (Some(local), Some(remote)) if local.id() == remote.id() => Verdict::UpToDate,
            (Some(local), Some(remote)) => {
                if local.height() > remote.height() && is_ancestor(lineage, remote, local) {
                    Verdict::FastForwardPush
                } else if remote.height() > local.height() && is_ancestor(lineage, local, remote) {
                    Verdict::FastForwardPull
                } else {
                    Verdict::Diverged
                }
            }
        };
        debug!(
            world = %world_id,
            local = ?local_head.map(|c| c.id().short()),
            remote = ?remote_head.map(|c| c.id().short()),
            ?verdict,
            "resolved histories"
        );
        verdict
    }
}

/// True if `ancestor` is reachable from `descendant` through parent links.
///
/// The walk stops at the ancestor's height, and at the first parent the
/// lineage does not know about.
fn is_ancestor(lineage: &dyn Lineage, ancestor: &Commit, descendant: &Commit) -> bool {
    let mut cursor = descendant.parent().copied();
    while let Some(id) = cursor {
        if &id == ancestor.id() {
            return true;
        }
        match lineage.commit(&id) {
            Some(commit) if commit.height() > ancestor.height() => {
                cursor = commit.parent().copied();
            }
            _ => return false,
        }
    }
    false
}
