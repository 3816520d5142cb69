//! Error types for the sync engine.

use crate::remote::RemoteError;
use crate::state::SyncState;
use std::fmt;
use thiserror::Error;
use worldsync_core::{CoreError, WorldId};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The local world directory could not be scanned.
    #[error("scan failed: {0}")]
    ScanFailed(#[source] CoreError),

    /// The remote rejected the session and logging in again did not help.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A remote operation failed after exhausting its retries.
    #[error("transfer of {what} failed after {attempts} attempt(s): {message}")]
    TransferFailed {
        /// What was being transferred.
        what: String,
        /// Attempts made.
        attempts: u32,
        /// Last error seen.
        message: String,
    },

    /// A head moved between observation and append.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Histories cannot be reconciled without a manual choice.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The world already has an active job.
    #[error("a sync job is already running for world {0}")]
    JobInProgress(WorldId),

    /// The job was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The world is not registered.
    #[error("unknown world {0}")]
    UnknownWorld(WorldId),

    /// A hosted world has not been given a local directory yet.
    #[error("world {0} has no local path")]
    NoLocalPath(WorldId),

    /// No job has run for the world yet.
    #[error("no sync job has run for world {0}")]
    NoJob(WorldId),

    /// The world's last job stopped on authentication; sign in and resume.
    #[error("world {0} is waiting for login")]
    AwaitingLogin(WorldId),

    /// Resume was asked for a world that is not waiting for login.
    #[error("world {0} is not waiting for login")]
    NotAwaitingLogin(WorldId),

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: SyncState,
        /// Attempted target state.
        to: SyncState,
    },

    /// Non-retryable remote error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Local storage error outside of scanning.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),

    /// Commands were issued outside a Tokio runtime.
    #[error("no Tokio runtime available")]
    NoRuntime,

    /// A background task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Creates a transfer failure.
    pub fn transfer_failed(what: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        Self::TransferFailed {
            what: what.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Maps a core error raised while scanning.
    pub(crate) fn from_scan(err: CoreError) -> Self {
        match err {
            CoreError::ScanCancelled => Self::Cancelled,
            other => Self::ScanFailed(other),
        }
    }

    /// Maps a core error raised while settling.
    pub(crate) fn from_settle(err: CoreError) -> Self {
        match err {
            CoreError::ConcurrentModification { expected, actual } => {
                Self::ConcurrentModification(format!(
                    "local head moved from {expected:?} to {actual:?}"
                ))
            }
            other => Self::Storage(other),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::ConcurrentModification(_) => true,
            _ => false,
        }
    }

    /// The failure category recorded on the world, if this error ends a job
    /// in `Error`.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            SyncError::ScanFailed(_) => Some(FailureReason::ScanFailed),
            SyncError::Auth(_) => Some(FailureReason::AuthError),
            SyncError::TransferFailed { .. } | SyncError::Remote(_) => {
                Some(FailureReason::TransferFailed)
            }
            SyncError::Conflict(_) | SyncError::ConcurrentModification(_) => {
                Some(FailureReason::Conflict)
            }
            SyncError::Storage(_) | SyncError::Task(_) | SyncError::NoLocalPath(_) => {
                Some(FailureReason::Storage)
            }
            SyncError::Cancelled
            | SyncError::JobInProgress(_)
            | SyncError::UnknownWorld(_)
            | SyncError::NoJob(_)
            | SyncError::AwaitingLogin(_)
            | SyncError::NotAwaitingLogin(_)
            | SyncError::InvalidStateTransition { .. }
            | SyncError::NoRuntime => None,
        }
    }
}

/// Why a world is in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The local directory could not be read.
    ScanFailed,
    /// The session could not be established.
    AuthError,
    /// A transfer exhausted its retries.
    TransferFailed,
    /// Histories diverged or the remote kept moving; needs a manual choice.
    Conflict,
    /// Writing local state failed.
    Storage,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureReason::ScanFailed => "ScanFailed",
            FailureReason::AuthError => "AuthError",
            FailureReason::TransferFailed => "TransferFailed",
            FailureReason::Conflict => "Conflict",
            FailureReason::Storage => "Storage",
        };
        f.write_str(name)
    }
}

/// The last failure of a world: reason plus human message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Category.
    pub reason: FailureReason,
    /// Description shown to the user.
    pub message: String,
}

impl Failure {
    /// Creates a failure.
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// True for failures a user resolves by picking a side.
    pub fn is_conflict(&self) -> bool {
        self.reason == FailureReason::Conflict
    }

    /// True if the job is parked until the user signs in again.
    pub fn needs_login(&self) -> bool {
        self.reason == FailureReason::AuthError
    }

    /// True for failures where a plain retry may succeed.
    ///
    /// Blobs already transferred are found again by content hash, so a
    /// retried job resumes rather than restarts.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.reason,
            FailureReason::TransferFailed | FailureReason::ScanFailed
        )
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}
