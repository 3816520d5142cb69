//! The sync engine.
//!
//! One [`SyncEngine`] tracks many worlds and runs at most one job per world
//! at a time. A job walks the state machine in [`crate::state`]:
//!
//! 1. **Scanning**: snapshot the local directory, fetch the remote history,
//!    compare lineages and decide whether to push, pull, do nothing or stop
//!    with a conflict.
//! 2. **Uploading / Downloading**: hand the blobs to the transfer
//!    coordinator and republish its progress on the world record.
//! 3. **Settling**: the point of no return. A push publishes every commit
//!    the remote lacks, the new one included, and only then appends the new
//!    commit locally; a pull writes the files and appends the remote
//!    commits in one batch. If a head moved underneath, nothing was
//!    committed and the job goes back to scanning a bounded number of
//!    times, cancellable again.
//!
//! A job the remote refused to authenticate is parked rather than retried:
//! the world stays in `Error` with [`FailureReason::AuthError`] until the
//! user signs in and [`SyncEngine::resume_after_login`] re-runs it.
//!
//! ## Key Invariants
//!
//! - A cancelled job never reaches `Synced` and never appends a commit
//! - Progress never decreases within a job and ends at 100 before settling
//! - Diverged histories are never merged; the user picks a side
//! - Only the engine writes to the registry

use crate::config::EngineConfig;
use crate::error::{Failure, FailureReason, SyncError, SyncResult};
use crate::job::{ConflictSide, Direction, JobId, JobRequest, JobToken, SyncJob};
use crate::registry::{WorldRecord, WorldRegistry};
use crate::remote::{RemoteError, RemoteStore};
use crate::retry::Retrier;
use crate::session::{Session, SessionProvider};
use crate::state::SyncState;
use crate::transfer::{BlobSource, TransferCoordinator, TransferEvent, TransferPlan, TransferStats};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use worldsync_core::{
    materialize, now_millis, resolve_key, Author, BlobStore, Commit, CommitId, CommitIndex,
    CommitStore, ConflictResolver, FsBlobStore, LocalWorld, MemoryBlobStore, Snapshot,
    SnapshotBuilder, SnapshotId, Verdict, WorldId,
};

const COMMITS_DIR: &str = "commits";
const BLOBS_DIR: &str = "blobs";
const DIVERGED: &str = "local and remote histories have diverged";

/// What a successful job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Nothing needed moving.
    UpToDate,
    /// Local commits were published.
    Pushed,
    /// Remote commits were written locally.
    Pulled,
}

/// Result of a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    /// The job.
    pub job: JobId,
    /// What happened.
    pub action: SyncAction,
    /// Head of the world's history afterwards.
    pub head: Option<CommitId>,
    /// Blob counts.
    pub stats: TransferStats,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The world is in sync.
    Synced(SyncSummary),
    /// The job was cancelled; nothing was committed.
    Cancelled,
    /// The job failed; the world is in `Error`.
    Failed(Failure),
}

impl JobOutcome {
    /// True for `Synced`.
    pub fn is_synced(&self) -> bool {
        matches!(self, JobOutcome::Synced(_))
    }

    /// The failure, if the job failed.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            JobOutcome::Failed(f) => Some(f),
            _ => None,
        }
    }
}

/// What scanning decided.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Plan {
    Nothing,
    Push { commit: bool },
    Pull,
    Conflict(String),
}

/// Maps a lineage verdict to an action for the requested direction.
fn plan(request: &JobRequest, verdict: Verdict, dirty: bool, has_remote: bool) -> Plan {
    use Verdict::*;
    match (request.direction, request.force) {
        (Direction::Push, false) => match verdict {
            UpToDate if !dirty => Plan::Nothing,
            UpToDate | FastForwardPush => Plan::Push { commit: dirty },
            FastForwardPull => {
                Plan::Conflict("remote has commits not present locally; pull first".into())
            }
            Diverged => Plan::Conflict(DIVERGED.into()),
        },
        (Direction::Push, true) => match verdict {
            UpToDate if !dirty => Plan::Nothing,
            UpToDate | FastForwardPush => Plan::Push { commit: dirty },
            FastForwardPull | Diverged => Plan::Push { commit: true },
        },
        (Direction::Pull, false) => match verdict {
            FastForwardPull if !dirty => Plan::Pull,
            FastForwardPull => Plan::Conflict(
                "local changes are not committed; push them or keep one side".into(),
            ),
            UpToDate | FastForwardPush => Plan::Nothing,
            Diverged => Plan::Conflict(DIVERGED.into()),
        },
        (Direction::Pull, true) => {
            if !has_remote {
                Plan::Conflict("remote has no history to restore".into())
            } else if verdict == UpToDate && !dirty {
                Plan::Nothing
            } else {
                Plan::Pull
            }
        }
        (Direction::Auto, _) => match verdict {
            FastForwardPull if !dirty => Plan::Pull,
            UpToDate if !dirty => Plan::Nothing,
            UpToDate | FastForwardPush => Plan::Push { commit: dirty },
            FastForwardPull | Diverged => Plan::Conflict(DIVERGED.into()),
        },
    }
}

struct Scan {
    snapshot: Snapshot,
    /// Most recent first.
    local_history: Vec<Commit>,
    /// Most recent first.
    remote_history: Vec<Commit>,
    verdict: Verdict,
    dirty: bool,
}

impl Scan {
    fn local_head(&self) -> Option<&Commit> {
        self.local_history.first()
    }

    fn remote_head(&self) -> Option<&Commit> {
        self.remote_history.first()
    }
}

struct ActiveJob {
    job: SyncJob,
    token: JobToken,
    done: watch::Receiver<Option<JobOutcome>>,
}

struct WorldSlot {
    state: SyncState,
    active: Option<ActiveJob>,
    last_request: Option<JobRequest>,
    last_outcome: Option<JobOutcome>,
}

impl WorldSlot {
    fn new() -> Self {
        Self {
            state: SyncState::Idle,
            active: None,
            last_request: None,
            last_outcome: None,
        }
    }

    fn awaits_login(&self) -> bool {
        self.state == SyncState::Error
            && self
                .last_outcome
                .as_ref()
                .and_then(JobOutcome::failure)
                .is_some_and(Failure::needs_login)
    }
}

struct EngineInner<R, P> {
    config: EngineConfig,
    author: Author,
    store: Arc<CommitStore>,
    blobs: Arc<dyn BlobStore>,
    registry: Arc<WorldRegistry>,
    remote: Arc<R>,
    retrier: Retrier<P>,
    transfers: TransferCoordinator<R, P>,
    builder: SnapshotBuilder,
    resolver: ConflictResolver,
    slots: Mutex<HashMap<WorldId, WorldSlot>>,
}

/// Drives sync jobs for a set of worlds.
///
/// Cloning is cheap; clones share everything.
pub struct SyncEngine<R, P> {
    inner: Arc<EngineInner<R, P>>,
}

impl<R, P> Clone for SyncEngine<R, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteStore, P: SessionProvider> SyncEngine<R, P> {
    /// Creates an engine around an existing commit store.
    ///
    /// Downloaded blobs are cached under `state_dir/blobs`, or in memory
    /// when no state directory is configured.
    pub fn new(
        config: EngineConfig,
        author: Author,
        store: Arc<CommitStore>,
        remote: R,
        session: P,
    ) -> SyncResult<Self> {
        let blobs: Arc<dyn BlobStore> = match &config.state_dir {
            Some(dir) => Arc::new(FsBlobStore::open(dir.join(BLOBS_DIR))?),
            None => Arc::new(MemoryBlobStore::new()),
        };
        let remote = Arc::new(remote);
        let retrier = Retrier::new(
            Arc::new(Session::new(session)),
            config.retry.clone(),
            config.attempt_timeout,
        );
        let transfers = TransferCoordinator::new(
            Arc::clone(&remote),
            retrier.clone(),
            config.max_concurrent_transfers,
            config.progress_step,
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                author,
                store,
                blobs,
                registry: Arc::new(WorldRegistry::new()),
                remote,
                retrier,
                transfers,
                builder: SnapshotBuilder::new(),
                resolver: ConflictResolver::new(),
                slots: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Creates an engine whose commit log lives under `state_dir/commits`,
    /// or in memory when no state directory is configured.
    pub fn open(config: EngineConfig, author: Author, remote: R, session: P) -> SyncResult<Self> {
        let store = match &config.state_dir {
            Some(dir) => CommitStore::open(&dir.join(COMMITS_DIR))?,
            None => CommitStore::in_memory(),
        };
        Self::new(config, author, Arc::new(store), remote, session)
    }

    /// The observable registry.
    pub fn registry(&self) -> &Arc<WorldRegistry> {
        &self.inner.registry
    }

    /// The local commit log.
    pub fn commit_store(&self) -> &Arc<CommitStore> {
        &self.inner.store
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// A world's record.
    pub fn world(&self, world: &WorldId) -> Option<WorldRecord> {
        self.inner.registry.get(world)
    }

    /// A world's machine state.
    pub fn state(&self, world: &WorldId) -> Option<SyncState> {
        self.inner.slots.lock().get(world).map(|s| s.state)
    }

    /// Starts tracking a local save. Registering the same save again
    /// returns the same id and updates its path.
    pub fn register_world(&self, local: &LocalWorld) -> WorldId {
        let inner = &self.inner;
        let id = WorldId::from_name(&local.name);
        let mut slots = inner.slots.lock();
        if let Some(slot) = slots.get(&id) {
            if slot.active.is_none() {
                inner
                    .registry
                    .update(&id, |r| r.set_local_path(local.path.clone()));
            }
            return id;
        }
        let mut record = WorldRecord::local(id, local.name.clone(), local.path.clone());
        record.set_commits(inner.history_ids(&id));
        slots.insert(id, WorldSlot::new());
        inner.registry.insert(record);
        info!(world = %id, name = %local.name, path = %local.path.display(), "registered world");
        id
    }

    /// Starts tracking a world hosted by another user. It needs a local
    /// path ([`attach_path`](Self::attach_path)) before it can sync.
    pub fn register_hosted_world(&self, id: WorldId, name: &str, host: Author) -> WorldId {
        let inner = &self.inner;
        let mut slots = inner.slots.lock();
        if slots.contains_key(&id) {
            return id;
        }
        let mut record = WorldRecord::hosted(id, name, host);
        record.set_commits(inner.history_ids(&id));
        slots.insert(id, WorldSlot::new());
        inner.registry.insert(record);
        info!(world = %id, name, "registered hosted world");
        id
    }

    /// Sets the directory a world syncs into.
    pub fn attach_path(&self, world: &WorldId, path: impl Into<PathBuf>) -> SyncResult<()> {
        let slots = self.inner.slots.lock();
        let slot = slots.get(world).ok_or(SyncError::UnknownWorld(*world))?;
        if slot.active.is_some() {
            return Err(SyncError::JobInProgress(*world));
        }
        let path = path.into();
        self.inner
            .registry
            .update(world, |r| r.set_local_path(path))
            .ok_or(SyncError::UnknownWorld(*world))?;
        Ok(())
    }

    /// Stops tracking a world. Its local commit log is kept.
    pub fn unlink_world(&self, world: &WorldId) -> SyncResult<()> {
        let mut slots = self.inner.slots.lock();
        let slot = slots.get(world).ok_or(SyncError::UnknownWorld(*world))?;
        if slot.active.is_some() {
            return Err(SyncError::JobInProgress(*world));
        }
        slots.remove(world);
        self.inner.registry.remove(world);
        info!(world = %world, "unlinked world");
        Ok(())
    }

    /// Starts a job in `direction`. See [`start_job`](Self::start_job).
    pub fn start_sync(&self, world: &WorldId, direction: Direction) -> SyncResult<JobId> {
        self.start_job(world, JobRequest::new(direction))
    }

    /// Starts a job and returns immediately; use [`wait`](Self::wait) for
    /// the outcome.
    ///
    /// # Errors
    ///
    /// - [`SyncError::JobInProgress`] if the world already has a job
    /// - [`SyncError::UnknownWorld`] / [`SyncError::NoLocalPath`]
    /// - [`SyncError::NoRuntime`] outside a Tokio runtime
    pub fn start_job(&self, world: &WorldId, request: JobRequest) -> SyncResult<JobId> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let inner = &self.inner;

        let mut slots = inner.slots.lock();
        let slot = slots.get_mut(world).ok_or(SyncError::UnknownWorld(*world))?;
        if slot.active.is_some() || !slot.state.can_start_sync() {
            return Err(SyncError::JobInProgress(*world));
        }
        let has_path = inner
            .registry
            .get(world)
            .ok_or(SyncError::UnknownWorld(*world))?
            .local_path()
            .is_some();
        if !has_path {
            return Err(SyncError::NoLocalPath(*world));
        }

        if slot.state == SyncState::Error {
            inner.apply_state(world, slot, SyncState::Idle, None)?;
        }
        inner.apply_state(world, slot, SyncState::Scanning, None)?;

        let job = SyncJob::new(*world, request.clone());
        let token = JobToken::new();
        let (tx, rx) = watch::channel(None);
        slot.active = Some(ActiveJob {
            job: job.clone(),
            token: token.clone(),
            done: rx,
        });
        slot.last_request = Some(request);
        drop(slots);

        info!(
            world = %world,
            job = %job.id,
            direction = ?job.request.direction,
            force = job.request.force,
            "sync job started"
        );
        let id = job.id;
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move { inner.run_job(job, token, tx).await });
        Ok(id)
    }

    /// Re-runs a conflicted world, keeping one side.
    pub fn resolve_conflict(&self, world: &WorldId, side: ConflictSide) -> SyncResult<JobId> {
        info!(world = %world, ?side, "resolving conflict");
        self.start_job(world, JobRequest::resolve(side))
    }

    /// Requests cancellation of the world's job.
    ///
    /// Returns `Ok(false)` if there is no job or the job is already
    /// settling and can no longer be cancelled.
    pub fn cancel_sync(&self, world: &WorldId) -> SyncResult<bool> {
        let slots = self.inner.slots.lock();
        let slot = slots.get(world).ok_or(SyncError::UnknownWorld(*world))?;
        let Some(active) = &slot.active else {
            return Ok(false);
        };
        let accepted = active.token.cancel();
        if accepted {
            info!(world = %world, job = %active.job.id, "cancellation requested");
        } else {
            debug!(world = %world, job = %active.job.id, "job is settling, cancel refused");
        }
        Ok(accepted)
    }

    /// Re-runs the last job of a world in `Error`.
    ///
    /// A job parked on an authentication failure is not retried blindly:
    /// it fails with [`SyncError::AwaitingLogin`] until
    /// [`resume_after_login`](Self::resume_after_login).
    pub fn retry(&self, world: &WorldId) -> SyncResult<JobId> {
        let (request, needs_login) = self.inner.failed_request(world)?;
        if needs_login {
            return Err(SyncError::AwaitingLogin(*world));
        }
        info!(world = %world, "retrying sync");
        self.start_job(world, request)
    }

    /// Resumes a job parked on an authentication failure, after the user
    /// signed in again. The cached session is dropped so the provider is
    /// asked for a fresh token; blobs that already landed are skipped.
    pub fn resume_after_login(&self, world: &WorldId) -> SyncResult<JobId> {
        let (request, needs_login) = self.inner.failed_request(world)?;
        if !needs_login {
            return Err(SyncError::NotAwaitingLogin(*world));
        }
        self.inner.retrier.session().invalidate();
        info!(world = %world, "resuming sync after login");
        self.start_job(world, request)
    }

    /// Worlds whose last job is parked waiting for the user to sign in.
    pub fn awaiting_login(&self) -> Vec<WorldId> {
        let slots = self.inner.slots.lock();
        let mut worlds: Vec<WorldId> = slots
            .iter()
            .filter(|(_, slot)| slot.awaits_login())
            .map(|(id, _)| *id)
            .collect();
        worlds.sort_unstable_by_key(|id| id.to_string());
        worlds
    }

    /// The world's local history, most recent first.
    pub fn get_history(&self, world: &WorldId) -> SyncResult<Vec<Commit>> {
        if self.inner.registry.get(world).is_none() {
            return Err(SyncError::UnknownWorld(*world));
        }
        Ok(self.inner.store.history(world))
    }

    /// Waits for the world's current job, or returns the last outcome if
    /// none is running.
    pub async fn wait(&self, world: &WorldId) -> SyncResult<JobOutcome> {
        let mut done = {
            let slots = self.inner.slots.lock();
            let slot = slots.get(world).ok_or(SyncError::UnknownWorld(*world))?;
            match &slot.active {
                Some(active) => active.done.clone(),
                None => return slot.last_outcome.clone().ok_or(SyncError::NoJob(*world)),
            }
        };
        let outcome = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SyncError::Task("job ended without an outcome".into()))?
            .clone();
        outcome.ok_or_else(|| SyncError::Task("job ended without an outcome".into()))
    }
}

impl<R: RemoteStore, P: SessionProvider> EngineInner<R, P> {
    /// The request of a world's failed job, and whether it failed on
    /// authentication.
    fn failed_request(&self, world: &WorldId) -> SyncResult<(JobRequest, bool)> {
        let slots = self.slots.lock();
        let slot = slots.get(world).ok_or(SyncError::UnknownWorld(*world))?;
        if slot.state != SyncState::Error {
            return Err(SyncError::InvalidStateTransition {
                from: slot.state,
                to: SyncState::Idle,
            });
        }
        let request = slot.last_request.clone().ok_or(SyncError::NoJob(*world))?;
        Ok((request, slot.awaits_login()))
    }

    fn history_ids(&self, world: &WorldId) -> Vec<CommitId> {
        self.store.history(world).iter().map(|c| *c.id()).collect()
    }

    fn apply_state(
        &self,
        world: &WorldId,
        slot: &mut WorldSlot,
        next: SyncState,
        progress: Option<u8>,
    ) -> SyncResult<()> {
        if !slot.state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: slot.state,
                to: next,
            });
        }
        debug!(world = %world, from = ?slot.state, to = ?next, "state transition");
        slot.state = next;
        if let Some(status) = next.display_status() {
            self.registry.update(world, |r| {
                r.set_status(status);
                if let Some(p) = progress {
                    r.set_progress(p);
                }
            });
        }
        Ok(())
    }

    fn transition(&self, world: &WorldId, next: SyncState, progress: Option<u8>) -> SyncResult<()> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(world).ok_or(SyncError::UnknownWorld(*world))?;
        self.apply_state(world, slot, next, progress)
    }

    async fn run_job(
        self: Arc<Self>,
        job: SyncJob,
        token: JobToken,
        done: watch::Sender<Option<JobOutcome>>,
    ) {
        let outcome = match self.drive(&job, &token).await {
            Ok(summary) => JobOutcome::Synced(summary),
            Err(SyncError::Cancelled) => JobOutcome::Cancelled,
            Err(e) => {
                let reason = e.failure_reason().unwrap_or(FailureReason::Storage);
                JobOutcome::Failed(Failure::new(reason, e.to_string()))
            }
        };
        self.finish(&job, &outcome);
        let _ = done.send(Some(outcome));
    }

    fn finish(&self, job: &SyncJob, outcome: &JobOutcome) {
        let world = job.world;
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&world) else {
            return;
        };
        let next = match outcome {
            JobOutcome::Synced(_) => SyncState::Synced,
            JobOutcome::Cancelled => SyncState::Idle,
            JobOutcome::Failed(_) => SyncState::Error,
        };
        if !slot.state.can_transition_to(next) {
            warn!(world = %world, from = ?slot.state, to = ?next, "unexpected final transition");
        }
        slot.state = next;

        let commits = self.history_ids(&world);
        self.registry.update(&world, |r| {
            r.set_commits(commits);
            match outcome {
                JobOutcome::Failed(failure) => r.fail(failure.clone()),
                _ => {
                    if let Some(status) = next.display_status() {
                        r.set_status(status);
                    }
                }
            }
        });
        slot.active = None;
        slot.last_outcome = Some(outcome.clone());

        match outcome {
            JobOutcome::Synced(summary) => info!(
                world = %world,
                job = %job.id,
                action = ?summary.action,
                transferred = summary.stats.transferred,
                skipped = summary.stats.skipped,
                "sync job finished"
            ),
            JobOutcome::Cancelled => info!(world = %world, job = %job.id, "sync job cancelled"),
            JobOutcome::Failed(failure) if failure.needs_login() => {
                warn!(world = %world, job = %job.id, %failure, "sync job waiting for login")
            }
            JobOutcome::Failed(failure) => {
                warn!(world = %world, job = %job.id, %failure, "sync job failed")
            }
        }
    }

    async fn drive(&self, job: &SyncJob, token: &JobToken) -> SyncResult<SyncSummary> {
        let world = job.world;
        let path = self
            .registry
            .get(&world)
            .and_then(|r| r.local_path().map(Path::to_path_buf))
            .ok_or(SyncError::NoLocalPath(world))?;
        let mut floor: Option<u8> = None;
        let mut rescans = 0u32;

        loop {
            let scan = self.scan(job, token, &path).await?;
            let decided = plan(
                &job.request,
                scan.verdict,
                scan.dirty,
                scan.remote_head().is_some(),
            );
            debug!(world = %world, job = %job.id, verdict = ?scan.verdict, dirty = scan.dirty, plan = ?decided, "scan complete");

            let result = match decided {
                Plan::Conflict(message) => return Err(SyncError::Conflict(message)),
                Plan::Nothing => {
                    if !token.begin_commit() {
                        return Err(SyncError::Cancelled);
                    }
                    return Ok(SyncSummary {
                        job: job.id,
                        action: SyncAction::UpToDate,
                        head: scan.local_head().map(|c| *c.id()),
                        stats: TransferStats::default(),
                    });
                }
                Plan::Push { commit } => self.push(job, token, &path, &scan, commit, &mut floor).await,
                Plan::Pull => self.pull(job, token, &path, &scan, &mut floor).await,
            };

            match result {
                Err(SyncError::ConcurrentModification(reason)) => {
                    rescans += 1;
                    if rescans > self.config.settle_retries {
                        return Err(SyncError::Conflict(format!(
                            "history kept moving during sync: {reason}"
                        )));
                    }
                    warn!(world = %world, job = %job.id, rescans, %reason, "head moved while settling, rescanning");
                    token.reopen();
                    self.transition(&world, SyncState::Scanning, None)?;
                }
                other => return other,
            }
        }
    }

    async fn scan(&self, job: &SyncJob, token: &JobToken, path: &Path) -> SyncResult<Scan> {
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let world = job.world;
        let builder = self.builder.clone();
        let root = path.to_path_buf();
        let cancel = token.clone();
        let allow_missing = job.request.direction != Direction::Push;
        let snapshot = tokio::task::spawn_blocking(move || {
            if allow_missing && !root.exists() {
                return Snapshot::empty();
            }
            let is_cancelled = move || cancel.is_cancelled();
            builder.build_with_cancel(&root, &is_cancelled)
        })
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
        .map_err(SyncError::from_scan)?;

        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let remote_history = self.fetch_remote_history(&world).await?;
        let local_history = self.store.history(&world);
        let index = CommitIndex::from_histories(&local_history, &remote_history);
        let verdict = self.resolver.resolve(
            &world,
            local_history.first(),
            remote_history.first(),
            &index,
        );
        // A directory already holding the remote head's files has nothing
        // of its own to lose.
        let matches_remote = remote_history
            .first()
            .is_some_and(|head| head.snapshot() == snapshot.id());
        let dirty = !matches_remote
            && match local_history.first() {
                Some(head) => head.snapshot() != snapshot.id(),
                None => !snapshot.manifest().is_empty(),
            };
        Ok(Scan {
            snapshot,
            local_history,
            remote_history,
            verdict,
            dirty,
        })
    }

    async fn push(
        &self,
        job: &SyncJob,
        token: &JobToken,
        path: &Path,
        scan: &Scan,
        commit: bool,
        floor: &mut Option<u8>,
    ) -> SyncResult<SyncSummary> {
        let world = job.world;
        let snapshot = &scan.snapshot;

        let mut transfer = TransferPlan::upload();
        let manifest = snapshot.encoded_manifest();
        transfer.add_upload(
            *snapshot.id(),
            manifest.len() as u64,
            BlobSource::Bytes(Arc::from(manifest)),
        );
        for (hash, size) in snapshot.blobs() {
            let key = snapshot
                .path_for(&hash)
                .ok_or_else(|| SyncError::Task(format!("no path for blob {hash}")))?;
            transfer.add_upload(hash, size, BlobSource::File(resolve_key(path, key)?));
        }

        self.transition(&world, SyncState::Uploading, *floor)?;
        let stats = self.run_transfer(job, token, transfer, floor).await?;

        if !token.begin_commit() {
            return Err(SyncError::Cancelled);
        }
        self.transition(&world, SyncState::Settling, None)?;

        let local_head = scan.local_head();
        let remote_ids: HashSet<CommitId> = scan.remote_history.iter().map(|c| *c.id()).collect();
        let index = CommitIndex::from_histories(&scan.local_history, &[]);
        let mut outgoing: Vec<Commit> = match local_head {
            Some(head) => index
                .ancestry(head.id())
                .into_iter()
                .take_while(|c| !remote_ids.contains(c.id()))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        outgoing.reverse();

        let created = if commit {
            let created = Commit::new(
                local_head,
                *snapshot.id(),
                self.author.clone(),
                job.request.message.as_str(),
                now_millis(),
            )?;
            outgoing.push(created.clone());
            Some(created)
        } else {
            None
        };

        if !outgoing.is_empty() {
            let expected = scan.remote_head().map(|c| *c.id());
            let count = outgoing.len();
            self.publish(&world, outgoing, expected).await?;
            info!(world = %world, commits = count, "published commits");
        }

        // The remote holds the commit now; record it on the head it was
        // built on.
        if let Some(created) = created {
            let (id, height) = (*created.id(), created.height());
            self.store
                .append_commit(&world, local_head.map(Commit::id), created)
                .map_err(SyncError::from_settle)?;
            info!(world = %world, commit = %id.short(), height, "committed snapshot");
        }
        let head = self.store.head(&world).map(|c| *c.id());

        Ok(SyncSummary {
            job: job.id,
            action: SyncAction::Pushed,
            head,
            stats,
        })
    }

    async fn pull(
        &self,
        job: &SyncJob,
        token: &JobToken,
        path: &Path,
        scan: &Scan,
        floor: &mut Option<u8>,
    ) -> SyncResult<SyncSummary> {
        let world = job.world;
        let target_commit = scan
            .remote_head()
            .ok_or_else(|| SyncError::conflict("remote has no history"))?;
        let target = self.fetch_snapshot(target_commit.snapshot()).await?;

        let mut transfer = TransferPlan::download(Arc::clone(&self.blobs));
        for (hash, size) in target.blobs() {
            if scan.snapshot.contains_blob(&hash) {
                transfer.add_present(size);
            } else {
                transfer.add_download(hash, size);
            }
        }

        self.transition(&world, SyncState::Downloading, *floor)?;
        let stats = self.run_transfer(job, token, transfer, floor).await?;

        if !token.begin_commit() {
            return Err(SyncError::Cancelled);
        }
        self.transition(&world, SyncState::Settling, None)?;

        let blobs = Arc::clone(&self.blobs);
        let current = scan.snapshot.clone();
        let dir = path.to_path_buf();
        let written = target.clone();
        tokio::task::spawn_blocking(move || {
            materialize(&written, Some(&current), blobs.as_ref(), &dir)
        })
        .await
        .map_err(|e| SyncError::Task(e.to_string()))??;

        let local_ids: HashSet<CommitId> = scan.local_history.iter().map(|c| *c.id()).collect();
        let incoming: Vec<Commit> = scan
            .remote_history
            .iter()
            .rev()
            .filter(|c| !local_ids.contains(c.id()))
            .cloned()
            .collect();
        let appended = incoming.len();
        if !incoming.is_empty() {
            self.store
                .append_commits(&world, scan.local_head().map(Commit::id), incoming)
                .map_err(SyncError::from_settle)?;
        }
        info!(world = %world, commits = appended, head = %target_commit.id().short(), "pulled commits");

        Ok(SyncSummary {
            job: job.id,
            action: SyncAction::Pulled,
            head: Some(*target_commit.id()),
            stats,
        })
    }

    async fn run_transfer(
        &self,
        job: &SyncJob,
        token: &JobToken,
        plan: TransferPlan,
        floor: &mut Option<u8>,
    ) -> SyncResult<TransferStats> {
        let mut handle = self.transfers.transfer(job.id, token, plan);
        while let Some(event) = handle.next_event().await {
            if let TransferEvent::Progress(percent) = event {
                if floor.is_some_and(|f| percent < f) {
                    continue;
                }
                *floor = Some(percent);
                self.registry
                    .update(&job.world, |r| r.set_progress(percent));
            }
        }
        handle.join().await
    }

    async fn fetch_remote_history(&self, world: &WorldId) -> SyncResult<Vec<Commit>> {
        let world = *world;
        let remote = Arc::clone(&self.remote);
        let history = self
            .retrier
            .run("history", |session| {
                let remote = Arc::clone(&remote);
                async move { remote.fetch_history(&session, &world).await }
            })
            .await?;
        for commit in &history {
            commit
                .verify()
                .map_err(|e| SyncError::transfer_failed("history", 1, e.to_string()))?;
        }
        Ok(history)
    }

    async fn fetch_snapshot(&self, id: &SnapshotId) -> SyncResult<Snapshot> {
        if self.blobs.contains(id)? {
            let bytes = self.blobs.get(id)?;
            return Ok(Snapshot::from_encoded(id, &bytes)?);
        }
        let id = *id;
        let remote = Arc::clone(&self.remote);
        let bytes = self
            .retrier
            .run("manifest", |session| {
                let remote = Arc::clone(&remote);
                async move { remote.get_blob(&session, &id).await }
            })
            .await?;
        let snapshot = Snapshot::from_encoded(&id, &bytes)
            .map_err(|e| SyncError::transfer_failed("manifest", 1, e.to_string()))?;
        self.blobs.put(&id, &bytes)?;
        Ok(snapshot)
    }

    async fn publish(
        &self,
        world: &WorldId,
        commits: Vec<Commit>,
        expected: Option<CommitId>,
    ) -> SyncResult<()> {
        let world = *world;
        let commits: Arc<[Commit]> = commits.into();
        let remote = Arc::clone(&self.remote);
        let result = self
            .retrier
            .run("publish", |session| {
                let remote = Arc::clone(&remote);
                let commits = Arc::clone(&commits);
                async move {
                    remote
                        .publish(&session, &world, &commits, expected.as_ref())
                        .await
                }
            })
            .await;
        match result {
            Err(SyncError::Remote(RemoteError::Conflict { expected, actual })) => {
                Err(SyncError::ConcurrentModification(format!(
                    "remote head moved from {expected:?} to {actual:?}"
                )))
            }
            other => other,
        }
    }
}

impl<R, P> std::fmt::Debug for SyncEngine<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("author", &self.inner.author.name)
            .field("worlds", &self.inner.registry.len())
            .finish()
    }
}
