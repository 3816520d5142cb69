//! The remote store contract.
//!
//! The engine needs very little from a remote: a content-addressed blob
//! namespace and, per world, an ordered commit history whose head can be
//! advanced with compare-and-set. Anything satisfying [`RemoteStore`] can
//! back sync, from a cloud drive to a directory on a network share.

use crate::session::SessionToken;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use worldsync_core::{Commit, CommitId, ContentHash, WorldId};

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors reported by a remote store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Temporary failure (network, throttling); retrying may succeed.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The session token was rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// The requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A compare-and-set on a world head lost a race.
    #[error("remote head is {actual:?}, expected {expected:?}")]
    Conflict {
        /// Head the caller expected.
        expected: Option<CommitId>,
        /// Head actually present.
        actual: Option<CommitId>,
    },

    /// Permanent failure.
    #[error("remote error: {0}")]
    Fatal(String),
}

impl RemoteError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// A remote store holding blobs and per-world commit histories.
///
/// Methods return `Send` futures so calls can be spread over the transfer
/// pool.
pub trait RemoteStore: Send + Sync + 'static {
    /// True if the blob is present.
    fn has_blob(
        &self,
        session: &SessionToken,
        hash: &ContentHash,
    ) -> impl Future<Output = RemoteResult<bool>> + Send;

    /// Stores a blob. Storing a blob that already exists is a no-op.
    fn put_blob(
        &self,
        session: &SessionToken,
        hash: &ContentHash,
        data: &[u8],
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Reads a blob.
    fn get_blob(
        &self,
        session: &SessionToken,
        hash: &ContentHash,
    ) -> impl Future<Output = RemoteResult<Vec<u8>>> + Send;

    /// The world's history, most recent first. Unknown worlds have an
    /// empty history.
    fn fetch_history(
        &self,
        session: &SessionToken,
        world: &WorldId,
    ) -> impl Future<Output = RemoteResult<Vec<Commit>>> + Send;

    /// Appends `commits` (oldest first) if the world's head is still
    /// `expected_head`; fails with [`RemoteError::Conflict`] otherwise.
    fn publish(
        &self,
        session: &SessionToken,
        world: &WorldId,
        commits: &[Commit],
        expected_head: Option<&CommitId>,
    ) -> impl Future<Output = RemoteResult<()>> + Send;
}

/// Remote operations, for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    /// [`RemoteStore::has_blob`].
    HasBlob,
    /// [`RemoteStore::put_blob`].
    PutBlob,
    /// [`RemoteStore::get_blob`].
    GetBlob,
    /// [`RemoteStore::fetch_history`].
    FetchHistory,
    /// [`RemoteStore::publish`].
    Publish,
}

#[derive(Default)]
struct MemoryState {
    blobs: HashMap<ContentHash, Vec<u8>>,
    /// Oldest first.
    histories: HashMap<WorldId, Vec<Commit>>,
    faults: HashMap<RemoteOp, Vec<RemoteError>>,
    calls: HashMap<RemoteOp, u64>,
    accepted_tokens: Option<HashSet<String>>,
    latency: HashMap<RemoteOp, Duration>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Counts one blob read or write as in flight until dropped.
struct InFlight {
    state: Arc<Mutex<MemoryState>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.lock().in_flight -= 1;
    }
}

/// An in-memory remote for testing.
///
/// Clones share state, so two engines holding clones see one remote.
/// Failures can be queued per operation and are returned before the
/// operation touches any state.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls of `op` fail with `error`.
    pub fn fail_next(&self, op: RemoteOp, count: usize, error: RemoteError) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat(error).take(count));
    }

    /// Only accepts the given tokens from now on.
    pub fn accept_tokens<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().accepted_tokens = Some(tokens.into_iter().map(Into::into).collect());
    }

    /// Delays every blob read and write.
    pub fn set_latency(&self, latency: Duration) {
        let mut state = self.state.lock();
        state.latency.insert(RemoteOp::PutBlob, latency);
        state.latency.insert(RemoteOp::GetBlob, latency);
    }

    /// Delays every call of `op`.
    pub fn set_op_latency(&self, op: RemoteOp, latency: Duration) {
        self.state.lock().latency.insert(op, latency);
    }

    /// Most blob reads and writes that were ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().peak_in_flight
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: RemoteOp) -> u64 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Resets call counters.
    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.state.lock().blobs.len()
    }

    /// The world's history, most recent first, bypassing sessions and faults.
    pub fn history(&self, world: &WorldId) -> Vec<Commit> {
        self.state
            .lock()
            .histories
            .get(world)
            .map(|h| h.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    fn enter(&self, op: RemoteOp, session: &SessionToken) -> RemoteResult<Duration> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(queue) = state.faults.get_mut(&op) {
            if !queue.is_empty() {
                let err = queue.remove(0);
                debug!(?op, error = %err, "injected remote fault");
                return Err(err);
            }
        }
        if let Some(accepted) = &state.accepted_tokens {
            if !accepted.contains(session.as_str()) {
                return Err(RemoteError::Unauthorized);
            }
        }
        Ok(state.latency.get(&op).copied().unwrap_or_default())
    }

    fn start_blob(&self) -> InFlight {
        let mut state = self.state.lock();
        state.in_flight += 1;
        state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
        InFlight {
            state: Arc::clone(&self.state),
        }
    }

    async fn pause(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryRemote")
            .field("blobs", &state.blobs.len())
            .field("worlds", &state.histories.len())
            .finish()
    }
}

impl RemoteStore for MemoryRemote {
    async fn has_blob(&self, session: &SessionToken, hash: &ContentHash) -> RemoteResult<bool> {
        let latency = self.enter(RemoteOp::HasBlob, session)?;
        Self::pause(latency).await;
        let present = self.state.lock().blobs.contains_key(hash);
        Ok(present)
    }

    async fn put_blob(
        &self,
        session: &SessionToken,
        hash: &ContentHash,
        data: &[u8],
    ) -> RemoteResult<()> {
        let latency = self.enter(RemoteOp::PutBlob, session)?;
        let _flight = self.start_blob();
        Self::pause(latency).await;
        if &ContentHash::of(data) != hash {
            return Err(RemoteError::fatal(format!("content does not match {hash}")));
        }
        self.state
            .lock()
            .blobs
            .entry(*hash)
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn get_blob(&self, session: &SessionToken, hash: &ContentHash) -> RemoteResult<Vec<u8>> {
        let latency = self.enter(RemoteOp::GetBlob, session)?;
        let _flight = self.start_blob();
        Self::pause(latency).await;
        let data = self.state.lock().blobs.get(hash).cloned();
        data.ok_or_else(|| RemoteError::NotFound(hash.to_hex()))
    }

    async fn fetch_history(
        &self,
        session: &SessionToken,
        world: &WorldId,
    ) -> RemoteResult<Vec<Commit>> {
        let latency = self.enter(RemoteOp::FetchHistory, session)?;
        Self::pause(latency).await;
        Ok(self.history(world))
    }

    async fn publish(
        &self,
        session: &SessionToken,
        world: &WorldId,
        commits: &[Commit],
        expected_head: Option<&CommitId>,
    ) -> RemoteResult<()> {
        let latency = self.enter(RemoteOp::Publish, session)?;
        Self::pause(latency).await;
        let mut state = self.state.lock();
        let history = state.histories.entry(*world).or_default();
        let actual = history.last().map(|c| *c.id());
        if actual.as_ref() != expected_head {
            return Err(RemoteError::Conflict {
                expected: expected_head.copied(),
                actual,
            });
        }
        for commit in commits {
            if history.iter().any(|c| c.id() == commit.id()) {
                return Err(RemoteError::fatal(format!(
                    "commit {} already published",
                    commit.id()
                )));
            }
        }
        history.extend(commits.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldsync_core::Author;

    fn token() -> SessionToken {
        SessionToken::new("t")
    }

    fn commit(parent: Option<&Commit>, tag: &[u8]) -> Commit {
        Commit::new(parent, ContentHash::of(tag), Author::new("u", "U"), "Backup", 1).unwrap()
    }

    #[tokio::test]
    async fn blobs_roundtrip_and_count_calls() {
        let remote = MemoryRemote::new();
        let hash = ContentHash::of(b"chunk");
        assert!(!remote.has_blob(&token(), &hash).await.unwrap());
        remote.put_blob(&token(), &hash, b"chunk").await.unwrap();
        assert!(remote.has_blob(&token(), &hash).await.unwrap());
        assert_eq!(remote.get_blob(&token(), &hash).await.unwrap(), b"chunk");
        assert_eq!(remote.calls(RemoteOp::HasBlob), 2);
        assert_eq!(remote.calls(RemoteOp::PutBlob), 1);
        assert_eq!(remote.blob_count(), 1);
    }

    #[tokio::test]
    async fn put_rejects_wrong_hash() {
        let remote = MemoryRemote::new();
        let err = remote
            .put_blob(&token(), &ContentHash::of(b"a"), b"b")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Fatal(_)));
    }

    #[tokio::test]
    async fn injected_faults_come_first() {
        let remote = MemoryRemote::new();
        remote.fail_next(RemoteOp::HasBlob, 2, RemoteError::transient("flaky"));
        let hash = ContentHash::of(b"x");
        assert!(remote.has_blob(&token(), &hash).await.is_err());
        assert!(remote.has_blob(&token(), &hash).await.is_err());
        assert!(remote.has_blob(&token(), &hash).await.is_ok());
    }

    #[tokio::test]
    async fn publish_is_compare_and_set() {
        let remote = MemoryRemote::new();
        let world = WorldId::new();
        let c1 = commit(None, b"1");
        let c2 = commit(Some(&c1), b"2");

        remote.publish(&token(), &world, &[c1.clone()], None).await.unwrap();
        let err = remote
            .publish(&token(), &world, &[c2.clone()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Conflict { .. }));
        remote
            .publish(&token(), &world, &[c2.clone()], Some(c1.id()))
            .await
            .unwrap();

        let history = remote.fetch_history(&token(), &world).await.unwrap();
        assert_eq!(history, vec![c2, c1]);
    }

    #[tokio::test]
    async fn unknown_tokens_are_unauthorized() {
        let remote = MemoryRemote::new();
        remote.accept_tokens(["good"]);
        let hash = ContentHash::of(b"x");
        assert_eq!(
            remote.has_blob(&token(), &hash).await,
            Err(RemoteError::Unauthorized)
        );
        assert!(remote
            .has_blob(&SessionToken::new("good"), &hash)
            .await
            .is_ok());
    }

    #[test]
    fn retryable_classification() {
        assert!(RemoteError::transient("503").is_retryable());
        assert!(!RemoteError::Unauthorized.is_retryable());
        assert!(!RemoteError::NotFound("x".into()).is_retryable());
        assert!(!RemoteError::fatal("x").is_retryable());
    }
}
