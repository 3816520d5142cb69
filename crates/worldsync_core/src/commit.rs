//! Commits: immutable, authored references to a snapshot.

use crate::error::{CoreError, CoreResult};
use crate::types::{Author, CommitId, ContentHash, SnapshotId};
use serde::{Deserialize, Serialize};

/// An immutable point-in-time reference to one snapshot.
///
/// The id is the hash of the canonical encoding of every other field, so a
/// commit cannot be altered without changing its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    id: CommitId,
    parent: Option<CommitId>,
    height: u64,
    snapshot: SnapshotId,
    author: Author,
    timestamp_ms: i64,
    message: String,
}

/// The hashed portion of a commit.
#[derive(Serialize)]
struct CommitHeader<'a> {
    parent: Option<&'a CommitId>,
    height: u64,
    snapshot: &'a SnapshotId,
    author: &'a Author,
    timestamp_ms: i64,
    message: &'a str,
}

impl Commit {
    /// Creates a commit on top of `parent`.
    pub fn new(
        parent: Option<&Commit>,
        snapshot: SnapshotId,
        author: Author,
        message: impl Into<String>,
        timestamp_ms: i64,
    ) -> CoreResult<Self> {
        let message = message.into();
        let parent_id = parent.map(|p| p.id);
        let height = parent.map_or(1, |p| p.height + 1);
        let id = compute_id(
            parent_id.as_ref(),
            height,
            &snapshot,
            &author,
            timestamp_ms,
            &message,
        )?;
        Ok(Self {
            id,
            parent: parent_id,
            height,
            snapshot,
            author,
            timestamp_ms,
            message,
        })
    }

    /// The commit id.
    #[must_use]
    pub fn id(&self) -> &CommitId {
        &self.id
    }

    /// The predecessor in this commit's lineage.
    #[must_use]
    pub fn parent(&self) -> Option<&CommitId> {
        self.parent.as_ref()
    }

    /// Number of commits in this lineage, counting this one.
    #[must_use]
    pub fn height(&self) -> u64 {
        self.height
    }

    /// The referenced snapshot.
    #[must_use]
    pub fn snapshot(&self) -> &SnapshotId {
        &self.snapshot
    }

    /// Who made the commit.
    #[must_use]
    pub fn author(&self) -> &Author {
        &self.author
    }

    /// Creation time in Unix milliseconds.
    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Human message, e.g. "Backup" or "Manual Save".
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Checks that the id matches the content.
    ///
    /// Commits received from a remote or read from disk go through this
    /// before they are trusted.
    pub fn verify(&self) -> CoreResult<()> {
        let actual = compute_id(
            self.parent.as_ref(),
            self.height,
            &self.snapshot,
            &self.author,
            self.timestamp_ms,
            &self.message,
        )?;
        if actual != self.id {
            return Err(CoreError::invalid_format(format!(
                "commit {} does not match its content (hashes to {})",
                self.id, actual
            )));
        }
        if (self.parent.is_none()) != (self.height == 1) {
            return Err(CoreError::invalid_format(format!(
                "commit {} has height {} inconsistent with its parent",
                self.id, self.height
            )));
        }
        Ok(())
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes from CBOR and verifies the id.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let commit: Commit =
            ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))?;
        commit.verify()?;
        Ok(commit)
    }
}

fn compute_id(
    parent: Option<&CommitId>,
    height: u64,
    snapshot: &SnapshotId,
    author: &Author,
    timestamp_ms: i64,
    message: &str,
) -> CoreResult<CommitId> {
    let header = CommitHeader {
        parent,
        height,
        snapshot,
        author,
        timestamp_ms,
        message,
    };
    let mut buf = Vec::new();
    ciborium::into_writer(&header, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(CommitId::new(ContentHash::of(&buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> Author {
        Author::new("u1", "Steve")
    }

    #[test]
    fn chain_heights() {
        let root = Commit::new(None, ContentHash::of(b"s1"), author(), "Backup", 1).unwrap();
        let next = Commit::new(Some(&root), ContentHash::of(b"s2"), author(), "Backup", 2).unwrap();
        assert_eq!(root.height(), 1);
        assert_eq!(next.height(), 2);
        assert_eq!(next.parent(), Some(root.id()));
    }

    #[test]
    fn id_depends_on_metadata() {
        let snap = ContentHash::of(b"s");
        let a = Commit::new(None, snap, author(), "Backup", 1).unwrap();
        let b = Commit::new(None, snap, author(), "Manual Save", 1).unwrap();
        let c = Commit::new(None, snap, author(), "Backup", 1).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), c.id());
    }

    #[test]
    fn decode_verifies() {
        let commit = Commit::new(None, ContentHash::of(b"s"), author(), "m", 7).unwrap();
        let bytes = commit.encode().unwrap();
        assert_eq!(Commit::decode(&bytes).unwrap(), commit);

        let mut tampered = commit.clone();
        tampered.message = "edited".into();
        let bytes = tampered.encode().unwrap();
        assert!(Commit::decode(&bytes).is_err());
    }
}
