//! # WorldSync Sync Engine
//!
//! Sync state machine, transfer coordinator and remote contract for
//! WorldSync.
//!
//! This crate provides:
//! - Per-world sync state machine (idle → scanning → transfer → settling → synced)
//! - Bounded, retrying, cancellable blob transfers
//! - Session handling with re-login on rejected tokens
//! - An observable registry of tracked worlds
//! - Remote store contract with in-memory and directory implementations
//!
//! ## Architecture
//!
//! A job scans the local save, fetches the remote history and lets the
//! conflict resolver decide between push, pull, nothing and conflict. Blobs
//! move first; commits are appended only after every blob landed, so a
//! failed or cancelled job leaves both histories untouched.
//!
//! ## Key Invariants
//!
//! - At most one job per world
//! - Progress is monotonic within a job
//! - Cancellation is refused once a job is settling
//! - A commit is only published after all its blobs are on the remote

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod directory;
mod engine;
mod error;
mod job;
mod registry;
mod remote;
mod retry;
mod session;
mod state;
mod transfer;

pub use config::{Backoff, EngineConfig, Jitter, RetryConfig};
pub use directory::DirectoryRemote;
pub use engine::{JobOutcome, SyncAction, SyncEngine, SyncSummary};
pub use error::{Failure, FailureReason, SyncError, SyncResult};
pub use job::{ConflictSide, Direction, JobId, JobRequest, JobToken, SyncJob, DEFAULT_MESSAGE};
pub use registry::{RegistryEvent, WorldRecord, WorldRegistry, WorldStatus};
pub use remote::{MemoryRemote, RemoteError, RemoteOp, RemoteResult, RemoteStore};
pub use retry::Retrier;
pub use session::{Session, SessionProvider, SessionToken, StaticSession};
pub use state::SyncState;
pub use transfer::{
    BlobSource, TransferCoordinator, TransferEvent, TransferHandle, TransferKind, TransferPlan,
    TransferStats,
};
