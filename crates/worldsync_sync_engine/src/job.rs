//! Sync jobs and their cancellation tokens.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use worldsync_core::{now_millis, WorldId};

/// Default commit message for a sync.
pub const DEFAULT_MESSAGE: &str = "Backup";

/// Which way a job moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Record local changes and upload them.
    Push,
    /// Download remote commits into the local directory.
    Pull,
    /// Whichever of push or pull applies without conflict.
    Auto,
}

/// The side kept when resolving a conflict by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictSide {
    /// Keep the local directory and overwrite the remote head.
    KeepLocal,
    /// Keep the remote head and overwrite the local directory.
    KeepRemote,
}

impl ConflictSide {
    /// The forced direction that realizes this choice.
    pub fn direction(self) -> Direction {
        match self {
            ConflictSide::KeepLocal => Direction::Push,
            ConflictSide::KeepRemote => Direction::Pull,
        }
    }
}

/// Parameters of a job, kept so a failed job can be retried as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Direction.
    pub direction: Direction,
    /// Set when re-expressing a manual conflict choice.
    pub force: bool,
    /// Commit message for a push.
    pub message: String,
}

impl JobRequest {
    /// Creates an unforced request.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            force: false,
            message: DEFAULT_MESSAGE.to_string(),
        }
    }

    /// Creates the forced request for a conflict choice.
    pub fn resolve(side: ConflictSide) -> Self {
        let message = match side {
            ConflictSide::KeepLocal => "Keep local",
            ConflictSide::KeepRemote => "Keep remote",
        };
        Self {
            direction: side.direction(),
            force: true,
            message: message.to_string(),
        }
    }

    /// Sets the commit message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Identifier of a job.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.simple().to_string();
        f.write_str(&hex[..8])
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0.hyphenated())
    }
}

/// One in-flight reconciliation attempt for one world. Never persisted.
#[derive(Debug, Clone)]
pub struct SyncJob {
    /// Job id.
    pub id: JobId,
    /// Target world.
    pub world: WorldId,
    /// What was asked for.
    pub request: JobRequest,
    /// Creation time in Unix milliseconds.
    pub created_ms: i64,
}

impl SyncJob {
    pub(crate) fn new(world: WorldId, request: JobRequest) -> Self {
        Self {
            id: JobId::new(),
            world,
            request,
            created_ms: now_millis(),
        }
    }
}

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const COMMITTING: u8 = 2;

/// Cooperative cancellation token of a job.
///
/// A token starts running and moves either to cancelled or to committing.
/// While committing, cancellation is refused: the job is past the point
/// where it can stop without leaving partial results. A commit that lost a
/// race on a head is abandoned with [`reopen`](Self::reopen), which makes
/// the job cancellable again for its rescan. Cancelled is final.
#[derive(Clone, Default)]
pub struct JobToken {
    state: Arc<AtomicU8>,
}

impl JobToken {
    /// Creates a running token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns false if the job is already committing.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == CANCELLED,
        }
    }

    /// Enters the committing phase. Returns false if cancelled first.
    pub fn begin_commit(&self) -> bool {
        match self
            .state
            .compare_exchange(RUNNING, COMMITTING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == COMMITTING,
        }
    }

    /// Leaves the committing phase after nothing was committed. Returns
    /// false if the token was not committing.
    pub fn reopen(&self) -> bool {
        self.state
            .compare_exchange(COMMITTING, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// True once cancellation was accepted.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    /// True once the job entered the committing phase.
    pub fn is_committing(&self) -> bool {
        self.state.load(Ordering::SeqCst) == COMMITTING
    }
}

impl fmt::Debug for JobToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::SeqCst) {
            RUNNING => "running",
            CANCELLED => "cancelled",
            _ => "committing",
        };
        f.debug_tuple("JobToken").field(&state).finish()
    }
}
