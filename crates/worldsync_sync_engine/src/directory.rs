//! A remote store kept in a plain directory.
//!
//! Useful for a network share or a folder mirrored by a desktop sync
//! client. Layout:
//!
//! ```text
//! <root>/blobs/ab/cdef...   content-addressed blobs
//! <root>/commits/<world>.log
//! ```
//!
//! Session tokens are accepted but not checked.

use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use crate::session::SessionToken;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use worldsync_core::{
    BlobStore, Commit, CommitId, CommitStore, ContentHash, CoreError, FsBlobStore, WorldId,
};

struct DirectoryInner {
    root: PathBuf,
    blobs: FsBlobStore,
    commits: CommitStore,
}

/// A [`RemoteStore`] backed by a local directory.
#[derive(Clone)]
pub struct DirectoryRemote {
    inner: Arc<DirectoryInner>,
}

impl DirectoryRemote {
    /// Opens or creates a remote directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let root = root.into();
        let blobs = FsBlobStore::open(root.join("blobs"))?;
        let commits = CommitStore::open(&root.join("commits"))?;
        Ok(Self {
            inner: Arc::new(DirectoryInner {
                root,
                blobs,
                commits,
            }),
        })
    }

    /// The directory.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    async fn blocking<T, F>(&self, f: F) -> RemoteResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&DirectoryInner) -> RemoteResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| RemoteError::fatal(e.to_string()))?
    }
}

impl std::fmt::Debug for DirectoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryRemote")
            .field("root", &self.inner.root)
            .finish()
    }
}

fn map_core(err: CoreError) -> RemoteError {
    match err {
        CoreError::ConcurrentModification { expected, actual } => {
            RemoteError::Conflict { expected, actual }
        }
        CoreError::BlobNotFound(hash) => RemoteError::NotFound(hash.to_hex()),
        CoreError::Io(e) => RemoteError::transient(e.to_string()),
        other => RemoteError::fatal(other.to_string()),
    }
}

impl RemoteStore for DirectoryRemote {
    async fn has_blob(&self, _session: &SessionToken, hash: &ContentHash) -> RemoteResult<bool> {
        let hash = *hash;
        self.blocking(move |inner| inner.blobs.contains(&hash).map_err(map_core))
            .await
    }

    async fn put_blob(
        &self,
        _session: &SessionToken,
        hash: &ContentHash,
        data: &[u8],
    ) -> RemoteResult<()> {
        let hash = *hash;
        let data = data.to_vec();
        self.blocking(move |inner| inner.blobs.put(&hash, &data).map_err(map_core))
            .await
    }

    async fn get_blob(&self, _session: &SessionToken, hash: &ContentHash) -> RemoteResult<Vec<u8>> {
        let hash = *hash;
        self.blocking(move |inner| inner.blobs.get(&hash).map_err(map_core))
            .await
    }

    async fn fetch_history(
        &self,
        _session: &SessionToken,
        world: &WorldId,
    ) -> RemoteResult<Vec<Commit>> {
        Ok(self.inner.commits.history(world))
    }

    async fn publish(
        &self,
        _session: &SessionToken,
        world: &WorldId,
        commits: &[Commit],
        expected_head: Option<&CommitId>,
    ) -> RemoteResult<()> {
        let world = *world;
        let commits = commits.to_vec();
        let expected = expected_head.copied();
        self.blocking(move |inner| {
            inner
                .commits
                .append_commits(&world, expected.as_ref(), commits)
                .map_err(map_core)
        })
        .await
    }
}
