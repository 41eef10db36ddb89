//! Versioned, replica-aware document storage.
//!
//! Each [`Bucket`] is a fixed array of [`Vbucket`]s. A vbucket is an
//! append-only log of [`Document`] versions: every write produces a new
//! version with the next seqno and a fresh CAS, and readers pick the latest
//! version of a key. Replica reads only see versions older than the
//! configured replica latency, which is how the mock simulates replication lag.

mod bucket;
mod document;
mod error;
pub mod ids;
mod vbucket;

pub use bucket::{Bucket, BucketOptions, BucketSnapshot};
pub use document::{DATATYPE_JSON, DATATYPE_SNAPPY, DATATYPE_XATTR, Document};
pub use error::StoreError;
pub use vbucket::{FailoverEntry, MetaState, VbSnapshot, Vbucket};

/// Largest document body accepted by the store (20 MiB).
pub const MAX_VALUE_SIZE: usize = 20 * 1024 * 1024;

/// Map a key to its vbucket using the CRC32 hash clients use.
pub fn vbucket_for_key(key: &[u8], num_vbuckets: u16) -> u16 {
    if num_vbuckets == 0 {
        return 0;
    }
    let hash = (crc32fast::hash(key) >> 16) & 0x7fff;
    u16::try_from(hash % u32::from(num_vbuckets)).unwrap_or_default()
}
