//! Error types for the document store.

use thiserror::Error;

/// Errors raised by the versioned document store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Document not found")]
    NotFound,

    #[error("Document already exists")]
    Exists,

    #[error("CAS mismatch")]
    CasMismatch,

    #[error("Document is locked")]
    Locked,

    #[error("Document is not locked")]
    NotLocked,

    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooBig { size: usize, max: usize },

    #[error("Invalid vbucket: {0}")]
    InvalidVbucket(u16),

    #[error("Invalid sequence range ({start}, {end}]")]
    InvalidSeqRange { start: u64, end: u64 },

    #[error("Snapshot is not part of the vbucket history")]
    SnapshotNotInHistory,

    #[error("Snapshot covers {actual} vbuckets, bucket has {expected}")]
    SnapshotMismatch { expected: usize, actual: usize },

    #[error("Bucket must have at least one vbucket")]
    NoVbuckets,
}
