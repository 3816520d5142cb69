//! Error types for WorldSync core.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{CommitId, ContentHash};

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in WorldSync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A directory could not be scanned.
    #[error("scan of {path} failed: {source}")]
    ScanFailed {
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A scan was cancelled before it completed.
    #[error("scan cancelled")]
    ScanCancelled,

    /// CBOR or JSON encoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The head of a world's history moved since the caller observed it.
    #[error("concurrent modification: expected head {expected:?}, found {actual:?}")]
    ConcurrentModification {
        /// Head the caller expected.
        expected: Option<CommitId>,
        /// Head actually present.
        actual: Option<CommitId>,
    },

    /// A commit with this id is already recorded for the world.
    #[error("commit {0} already recorded")]
    DuplicateCommit(CommitId),

    /// A blob is not present in the store.
    #[error("blob not found: {0}")]
    BlobNotFound(ContentHash),

    /// Blob content does not hash to its declared id.
    #[error("blob {expected} is corrupt: content hashes to {actual}")]
    BlobCorrupt {
        /// Declared hash.
        expected: ContentHash,
        /// Hash of the bytes actually read.
        actual: ContentHash,
    },

    /// On-disk data is corrupted or invalid.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The commit store directory is locked by another process.
    #[error("commit store locked: another process has exclusive access")]
    StoreLocked,

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Decryption failed.
    #[error("decryption failed: {message}")]
    DecryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Invalid key size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// Local world discovery failed.
    #[error("discovery failed: {message}")]
    Discovery {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a scan failure for `path`.
    pub fn scan_failed(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ScanFailed {
            path: path.into(),
            source,
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an encryption failed error.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a decryption failed error.
    pub fn decryption_failed(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid key size error.
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }

    /// Creates a discovery error.
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    /// Returns true for errors raised while reading a local world directory.
    pub fn is_scan_failure(&self) -> bool {
        matches!(self, CoreError::ScanFailed { .. } | CoreError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_failure_display_names_path() {
        let err = CoreError::scan_failed(
            "/saves/World",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.to_string();
        assert!(text.contains("/saves/World"));
        assert!(text.contains("denied"));
        assert!(err.is_scan_failure());
    }

    #[test]
    fn concurrent_modification_is_not_scan_failure() {
        let err = CoreError::ConcurrentModification {
            expected: None,
            actual: None,
        };
        assert!(!err.is_scan_failure());
    }
}
