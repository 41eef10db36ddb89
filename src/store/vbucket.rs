//! A single vbucket: an append-only log of document versions.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use super::document::Document;
use super::error::StoreError;
use super::ids::{new_cas, new_vb_uuid};
use super::MAX_VALUE_SIZE;
use crate::clock::Chrono;
use crate::logging::debug;

/// One line in the failover history: a vbucket UUID and the seqno it started at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEntry {
    pub vb_uuid: u64,
    pub seq_no: u64,
}

/// A point in a vbucket's history that it can later be rolled back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VbSnapshot {
    pub vb_uuid: u64,
    pub seq_no: u64,
}

/// Sequence numbers visible to a given replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaState {
    pub vb_uuid: u64,
    pub current_seq_no: u64,
    pub persist_seq_no: u64,
}

/// How a write assigns the CAS of the new version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CasPolicy {
    Generate,
    Keep,
}

#[derive(Debug)]
struct VbucketState {
    documents: Vec<Document>,
    max_seq_no: u64,
    history: Vec<FailoverEntry>,
}

impl VbucketState {
    fn fresh() -> Self {
        Self {
            documents: Vec::new(),
            max_seq_no: 0,
            history: vec![FailoverEntry {
                vb_uuid: new_vb_uuid(),
                seq_no: 0,
            }],
        }
    }

    fn vb_uuid(&self) -> u64 {
        self.history.last().map(|e| e.vb_uuid).unwrap_or_default()
    }

    /// Latest version of a key among versions modified strictly before `cutoff`
    /// (or every version when `cutoff` is `None`).
    fn find(&self, cutoff: Option<SystemTime>, collection_id: u32, key: &[u8]) -> Option<&Document> {
        self.documents.iter().rev().find(|doc| {
            cutoff.is_none_or(|c| doc.modified < c)
                && doc.collection_id == collection_id
                && doc.key == key
        })
    }
}

/// Versioned log of documents for one vbucket.
#[derive(Debug)]
pub struct Vbucket {
    id: u16,
    chrono: Chrono,
    replica_latency: Duration,
    persist_latency: Duration,
    state: Mutex<VbucketState>,
}

impl Vbucket {
    pub fn new(id: u16, chrono: Chrono, replica_latency: Duration, persist_latency: Duration) -> Self {
        Self {
            id,
            chrono,
            replica_latency,
            persist_latency,
            state: Mutex::new(VbucketState::fresh()),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Cutoff before which a document must have been modified to be visible
    /// on replica `rep_idx`. The active copy (index 0) sees everything.
    fn replica_cutoff(&self, now: SystemTime, rep_idx: usize) -> Option<SystemTime> {
        if rep_idx == 0 {
            return None;
        }
        let lag = self
            .replica_latency
            .saturating_mul(u32::try_from(rep_idx).unwrap_or(u32::MAX));
        Some(now.checked_sub(lag).unwrap_or(SystemTime::UNIX_EPOCH))
    }

    /// Latest version of a key as seen from replica `rep_idx`, including
    /// tombstones. The CAS is not masked for locked documents.
    pub fn get(&self, rep_idx: usize, collection_id: u32, key: &[u8]) -> Result<Document, StoreError> {
        let now = self.chrono.now();
        let cutoff = self.replica_cutoff(now, rep_idx);
        let state = self.state.lock();
        state
            .find(cutoff, collection_id, key)
            .cloned()
            .map(|doc| doc.view_at(now))
            .ok_or(StoreError::NotFound)
    }

    /// Latest live version of every key in a collection, as seen from `rep_idx`.
    pub fn get_all(&self, rep_idx: usize, collection_id: u32) -> Vec<Document> {
        let now = self.chrono.now();
        let cutoff = self.replica_cutoff(now, rep_idx);
        let state = self.state.lock();

        let mut latest: HashMap<&[u8], &Document> = HashMap::new();
        for doc in state.documents.iter() {
            if doc.collection_id != collection_id || cutoff.is_some_and(|c| doc.modified >= c) {
                continue;
            }
            latest.insert(doc.key.as_slice(), doc);
        }
        let mut docs: Vec<Document> = latest
            .into_values()
            .cloned()
            .map(|doc| doc.view_at(now))
            .filter(|doc| !doc.is_deleted)
            .collect();
        docs.sort_by_key(|doc| doc.seq_no);
        docs
    }

    /// Every version with `start < seqno <= end`, plus the current vbuuid.
    pub fn get_all_within(&self, start: u64, end: u64) -> Result<(Vec<Document>, u64), StoreError> {
        let state = self.state.lock();
        if start >= end || end > state.max_seq_no {
            return Err(StoreError::InvalidSeqRange { start, end });
        }
        let docs = state
            .documents
            .iter()
            .filter(|doc| doc.seq_no > start && doc.seq_no <= end)
            .cloned()
            .collect();
        Ok((docs, state.vb_uuid()))
    }

    /// Add a document, failing with `Exists` if a live version is present.
    pub fn insert(&self, doc: Document) -> Result<Document, StoreError> {
        let collection_id = doc.collection_id;
        let key = doc.key.clone();
        self.update(collection_id, &key, move |current| match current {
            Some(existing) if !existing.is_deleted => Err(StoreError::Exists),
            _ => Ok(doc),
        })
    }

    /// Atomically read the current version and append the version `f` returns.
    ///
    /// The new version gets a fresh CAS, the next seqno and the current vbuuid.
    pub fn update<F, E>(&self, collection_id: u32, key: &[u8], f: F) -> Result<Document, E>
    where
        F: FnOnce(Option<Document>) -> Result<Document, E>,
        E: From<StoreError>,
    {
        self.write(collection_id, key, CasPolicy::Generate, |current, _| f(current))
    }

    /// Like [`Vbucket::update`] but keeps whatever CAS the returned document carries.
    pub fn update_keep_cas<F, E>(&self, collection_id: u32, key: &[u8], f: F) -> Result<Document, E>
    where
        F: FnOnce(Option<Document>) -> Result<Document, E>,
        E: From<StoreError>,
    {
        self.write(collection_id, key, CasPolicy::Keep, |current, _| f(current))
    }

    /// Like [`Vbucket::update`] but hands `f` the CAS the new version will be
    /// stored with, so the document body can refer to it.
    pub fn update_with_cas<F, E>(&self, collection_id: u32, key: &[u8], f: F) -> Result<Document, E>
    where
        F: FnOnce(Option<Document>, u64) -> Result<Document, E>,
        E: From<StoreError>,
    {
        self.write(collection_id, key, CasPolicy::Generate, f)
    }

    /// Time, CAS and seqno are all taken under the vbucket lock so that log
    /// order, modification time and CAS order agree.
    fn write<F, E>(&self, collection_id: u32, key: &[u8], cas: CasPolicy, f: F) -> Result<Document, E>
    where
        F: FnOnce(Option<Document>, u64) -> Result<Document, E>,
        E: From<StoreError>,
    {
        let mut state = self.state.lock();
        let now = self.chrono.now();
        let next_cas = match cas {
            CasPolicy::Generate => new_cas(),
            CasPolicy::Keep => 0,
        };

        let current = state.find(None, collection_id, key).cloned().map(|d| d.view_at(now));
        let previous_rev = current.as_ref().map(|d| d.rev_id).unwrap_or_default();
        let mut doc = f(current, next_cas)?;

        if doc.value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooBig {
                size: doc.value.len(),
                max: MAX_VALUE_SIZE,
            }
            .into());
        }

        state.max_seq_no += 1;
        doc.vb_id = self.id;
        doc.collection_id = collection_id;
        doc.key = key.to_vec();
        doc.seq_no = state.max_seq_no;
        doc.vb_uuid = state.vb_uuid();
        doc.modified = now;
        doc.rev_id = previous_rev.max(doc.rev_id) + 1;
        if cas == CasPolicy::Generate {
            doc.cas = next_cas;
        }
        state.documents.push(doc.clone());
        Ok(doc)
    }

    /// Seqnos visible on replica `rep_idx`, and how far persistence has caught up.
    pub fn current_meta_state(&self, rep_idx: usize) -> MetaState {
        let now = self.chrono.now();
        let visible_at = self.replica_cutoff(now, rep_idx).unwrap_or(now);
        let persisted_at = visible_at
            .checked_sub(self.persist_latency)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let state = self.state.lock();
        let mut meta = MetaState {
            vb_uuid: state.vb_uuid(),
            current_seq_no: 0,
            persist_seq_no: 0,
        };
        for doc in state.documents.iter() {
            if doc.modified <= visible_at {
                meta.current_seq_no = meta.current_seq_no.max(doc.seq_no);
            }
            if doc.modified <= persisted_at {
                meta.persist_seq_no = meta.persist_seq_no.max(doc.seq_no);
            }
        }
        meta
    }

    pub fn max_seq_no(&self) -> u64 {
        self.state.lock().max_seq_no
    }

    pub fn vb_uuid(&self) -> u64 {
        self.state.lock().vb_uuid()
    }

    /// Failover log, newest entry first.
    pub fn failover_log(&self) -> Vec<FailoverEntry> {
        self.state.lock().history.iter().rev().copied().collect()
    }

    pub fn snapshot(&self) -> VbSnapshot {
        let state = self.state.lock();
        VbSnapshot {
            vb_uuid: state.vb_uuid(),
            seq_no: state.max_seq_no,
        }
    }

    /// Whether `(vb_uuid, seq_no)` lies on this vbucket's history.
    pub fn is_in_history(&self, vb_uuid: u64, seq_no: u64) -> bool {
        let state = self.state.lock();
        Self::history_contains(&state, vb_uuid, seq_no)
    }

    fn history_contains(state: &VbucketState, vb_uuid: u64, seq_no: u64) -> bool {
        let Some(idx) = state.history.iter().rposition(|e| e.vb_uuid == vb_uuid) else {
            return false;
        };
        let Some(entry) = state.history.get(idx) else {
            return false;
        };
        if seq_no < entry.seq_no {
            return false;
        }
        match state.history.get(idx + 1) {
            Some(next) => seq_no <= next.seq_no,
            None => seq_no <= state.max_seq_no,
        }
    }

    /// Truncate the log back to a snapshot and start a new history line.
    pub fn rollback(&self, snapshot: VbSnapshot) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if !Self::history_contains(&state, snapshot.vb_uuid, snapshot.seq_no) {
            return Err(StoreError::SnapshotNotInHistory);
        }
        state.documents.retain(|doc| doc.seq_no <= snapshot.seq_no);
        state.max_seq_no = snapshot.seq_no;
        state.history.push(FailoverEntry {
            vb_uuid: new_vb_uuid(),
            seq_no: snapshot.seq_no,
        });
        debug!(vbucket = self.id, seq_no = snapshot.seq_no, "rolled back");
        Ok(())
    }

    /// Drop every document and start over with a new vbuuid.
    pub fn flush(&self) {
        *self.state.lock() = VbucketState::fresh();
    }
}
