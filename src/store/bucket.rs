//! A bucket's worth of vbuckets.

use std::time::Duration;

use rand::seq::SliceRandom;

use super::document::Document;
use super::error::StoreError;
use super::vbucket::{VbSnapshot, Vbucket};
use crate::clock::Chrono;

/// Options for [`Bucket::new`].
#[derive(Debug, Clone)]
pub struct BucketOptions {
    pub chrono: Chrono,
    pub num_vbuckets: u16,
    pub replica_latency: Duration,
    pub persist_latency: Duration,
}

/// Snapshot of every vbucket in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub vbuckets: Vec<VbSnapshot>,
}

/// Storage for one bucket: a fixed array of vbuckets.
#[derive(Debug)]
pub struct Bucket {
    vbuckets: Vec<Vbucket>,
}

impl Bucket {
    pub fn new(opts: BucketOptions) -> Result<Self, StoreError> {
        if opts.num_vbuckets == 0 {
            return Err(StoreError::NoVbuckets);
        }
        let vbuckets = (0..opts.num_vbuckets)
            .map(|id| {
                Vbucket::new(
                    id,
                    opts.chrono.clone(),
                    opts.replica_latency,
                    opts.persist_latency,
                )
            })
            .collect();
        Ok(Self { vbuckets })
    }

    pub fn num_vbuckets(&self) -> u16 {
        u16::try_from(self.vbuckets.len()).unwrap_or(u16::MAX)
    }

    pub fn vbucket(&self, vb_idx: u16) -> Result<&Vbucket, StoreError> {
        self.vbuckets
            .get(usize::from(vb_idx))
            .ok_or(StoreError::InvalidVbucket(vb_idx))
    }

    pub fn vbuckets(&self) -> impl Iterator<Item = &Vbucket> {
        self.vbuckets.iter()
    }

    /// Read a document. Locked documents report a CAS of `u64::MAX`.
    pub fn get(
        &self,
        rep_idx: usize,
        vb_idx: u16,
        collection_id: u32,
        key: &[u8],
    ) -> Result<Document, StoreError> {
        let mut doc = self.vbucket(vb_idx)?.get(rep_idx, collection_id, key)?;
        // `Vbucket::get` already cleared elapsed locks
        if doc.lock_expiry.is_some() {
            doc.cas = u64::MAX;
        }
        Ok(doc)
    }

    /// Latest live documents of a collection across every vbucket.
    pub fn get_all(&self, rep_idx: usize, collection_id: u32) -> Vec<Document> {
        self.vbuckets
            .iter()
            .flat_map(|vb| vb.get_all(rep_idx, collection_id))
            .collect()
    }

    /// A random live document from a collection.
    pub fn get_random(&self, rep_idx: usize, collection_id: u32) -> Option<Document> {
        let docs = self.get_all(rep_idx, collection_id);
        docs.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn insert(&self, doc: Document) -> Result<Document, StoreError> {
        self.vbucket(doc.vb_id)?.insert(doc)
    }

    pub fn update<F, E>(&self, vb_idx: u16, collection_id: u32, key: &[u8], f: F) -> Result<Document, E>
    where
        F: FnOnce(Option<Document>) -> Result<Document, E>,
        E: From<StoreError>,
    {
        self.vbucket(vb_idx)?.update(collection_id, key, f)
    }

    pub fn update_keep_cas<F, E>(
        &self,
        vb_idx: u16,
        collection_id: u32,
        key: &[u8],
        f: F,
    ) -> Result<Document, E>
    where
        F: FnOnce(Option<Document>) -> Result<Document, E>,
        E: From<StoreError>,
    {
        self.vbucket(vb_idx)?.update_keep_cas(collection_id, key, f)
    }

    pub fn update_with_cas<F, E>(
        &self,
        vb_idx: u16,
        collection_id: u32,
        key: &[u8],
        f: F,
    ) -> Result<Document, E>
    where
        F: FnOnce(Option<Document>, u64) -> Result<Document, E>,
        E: From<StoreError>,
    {
        self.vbucket(vb_idx)?.update_with_cas(collection_id, key, f)
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            vbuckets: self.vbuckets.iter().map(Vbucket::snapshot).collect(),
        }
    }

    /// Roll every vbucket back to the snapshot. Validates the whole snapshot
    /// before touching any vbucket.
    pub fn rollback(&self, snapshot: &BucketSnapshot) -> Result<(), StoreError> {
        if snapshot.vbuckets.len() != self.vbuckets.len() {
            return Err(StoreError::SnapshotMismatch {
                expected: self.vbuckets.len(),
                actual: snapshot.vbuckets.len(),
            });
        }
        let pairs = || self.vbuckets.iter().zip(snapshot.vbuckets.iter());
        if pairs().any(|(vb, snap)| !vb.is_in_history(snap.vb_uuid, snap.seq_no)) {
            return Err(StoreError::SnapshotNotInHistory);
        }
        for (vb, snap) in pairs() {
            vb.rollback(*snap)?;
        }
        Ok(())
    }

    pub fn flush(&self) {
        for vb in &self.vbuckets {
            vb.flush();
        }
    }
}
