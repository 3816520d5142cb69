//! # WorldSync Core
//!
//! Storage primitives for synchronizing game save directories.
//!
//! This crate provides:
//! - Content-addressed snapshots of a directory tree
//! - Local blob stores for snapshot content
//! - An append-only, per-world commit log
//! - Lineage comparison between local and remote histories
//! - Encrypted persistence of the user profile
//! - Discovery of installed saves
//!
//! ## Key Invariants
//!
//! - Scanning an unchanged directory yields the same snapshot id
//! - Commits are immutable and a world's history only grows
//! - Appends are compare-and-set against the observed head
//! - No automatic merge: diverged histories are reported, never combined

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod commit;
mod commit_store;
mod config;
mod crypto;
mod discovery;
mod error;
mod resolver;
mod snapshot;
mod types;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use commit::Commit;
pub use commit_store::{CommitStore, RECORD_MAGIC};
pub use config::{
    load_or_create_key, AppConfig, ConfigStore, EncryptedConfigStore, MemoryConfigStore,
};
pub use crypto::{CryptoManager, EncryptionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use discovery::{default_saves_dir, LocalWorldSource, SavesDirectory};
pub use error::{CoreError, CoreResult};
pub use resolver::{CommitIndex, ConflictResolver, Lineage, Verdict};
pub use snapshot::{
    hash_file, materialize, resolve_key, Manifest, ManifestEntry, Snapshot, SnapshotBuilder,
    DEFAULT_EXCLUDES, MANIFEST_VERSION,
};
pub use types::{
    now_millis, Author, CommitId, ContentHash, LocalWorld, SnapshotId, WorldId, HASH_SIZE,
};
