//! Per-world sync state machine.
//!
//! ```text
//! Idle ─▶ Scanning ─▶ Uploading ──┐
//!  ▲         │   └──▶ Downloading ─┴─▶ Settling ─▶ Synced
//!  │         ▼                            │
//!  └──── (cancel)         Error ◀─────────┘
//!  └──────────────── retry ──┘
//! ```
//!
//! Settling may go back to Scanning when a head moved underneath it.

use crate::registry::WorldStatus;

/// The state of one world's sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No job.
    Idle,
    /// Building the local snapshot and comparing histories.
    Scanning,
    /// Sending blobs to the remote.
    Uploading,
    /// Fetching blobs from the remote.
    Downloading,
    /// Writing commits and files; no longer cancellable.
    Settling,
    /// Last job finished successfully.
    Synced,
    /// Last job failed.
    Error,
}

impl SyncState {
    /// Returns true if a job is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Scanning
                | SyncState::Uploading
                | SyncState::Downloading
                | SyncState::Settling
        )
    }

    /// Returns true if a new job may start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }

    /// Returns true if a running job in this state accepts cancellation.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            SyncState::Scanning | SyncState::Uploading | SyncState::Downloading
        )
    }

    /// Returns true if `next` is a legal successor.
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Idle | Synced, Scanning)
                | (Error, Idle)
                | (Scanning, Uploading | Downloading | Settling | Synced | Error | Idle)
                | (Uploading | Downloading, Settling | Error | Idle)
                | (Settling, Synced | Error | Scanning)
        )
    }

    /// The status shown for this state. `None` for Settling, which keeps
    /// showing the transfer that preceded it.
    pub fn display_status(&self) -> Option<WorldStatus> {
        match self {
            SyncState::Idle => Some(WorldStatus::Idle),
            SyncState::Scanning => Some(WorldStatus::Scanning),
            SyncState::Uploading => Some(WorldStatus::Uploading),
            SyncState::Downloading => Some(WorldStatus::Downloading),
            SyncState::Settling => None,
            SyncState::Synced => Some(WorldStatus::Synced),
            SyncState::Error => Some(WorldStatus::Error),
        }
    }
}
