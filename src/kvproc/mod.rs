//! Document operations as the KV service performs them.
//!
//! An [`Engine`] binds a bucket's store to the vbuckets one node owns. Each
//! operation checks ownership, applies the memcached-style semantics (CAS
//! checks, locking, expiry encoding) and turns store failures into
//! [`ProcError`]s the protocol layer can map to status codes.

pub mod error;
pub mod subdoc;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use error::{ProcError, SubDocError};
pub use subdoc::{SubDocOp, SubDocResult};

use crate::clock::Chrono;
use crate::store::{self, DATATYPE_XATTR, Document, MetaState, StoreError};

/// Relative expiries are limited to 30 days; larger values are unix timestamps.
const RELATIVE_EXPIRY_LIMIT: u32 = 30 * 24 * 60 * 60;
/// Lock time used when GET_LOCKED asks for zero.
pub const DEFAULT_LOCK_TIME: u32 = 30;
/// Counter expiry meaning "do not create the document".
pub const COUNTER_NO_CREATE: u32 = 0xffff_ffff;
/// Attempts a multi-mutation makes before giving up on concurrent changes.
const MULTI_MUTATE_ATTEMPTS: usize = 10;

/// Identifies a document within a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocKey {
    pub vbucket: u16,
    pub collection_id: u32,
    pub key: Vec<u8>,
}

impl DocKey {
    pub fn new(vbucket: u16, collection_id: u32, key: impl Into<Vec<u8>>) -> Self {
        Self {
            vbucket,
            collection_id,
            key: key.into(),
        }
    }
}

/// Document contents returned by reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub key: Vec<u8>,
    pub cas: u64,
    pub datatype: u8,
    pub flags: u32,
    pub value: Vec<u8>,
}

impl GetResult {
    fn from_doc(doc: Document) -> Self {
        Self {
            key: doc.key,
            cas: doc.cas,
            // Plain reads never carry xattrs
            datatype: doc.datatype & !DATATYPE_XATTR,
            flags: doc.flags,
            value: doc.value,
        }
    }
}

/// Outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
    pub vb_uuid: u64,
    pub seq_no: u64,
}

impl MutationResult {
    fn from_doc(doc: &Document) -> Self {
        Self {
            cas: doc.cas,
            vb_uuid: doc.vb_uuid,
            seq_no: doc.seq_no,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub doc: DocKey,
    pub cas: u64,
    pub datatype: u8,
    pub flags: u32,
    pub expiry: u32,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct CounterOptions {
    pub doc: DocKey,
    pub cas: u64,
    pub delta: u64,
    pub initial: u64,
    pub expiry: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    pub value: u64,
    pub mutation: MutationResult,
}

/// Metadata returned by GET_META, including for deleted documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaResult {
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub rev_id: u64,
    pub datatype: u8,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    pub doc: DocKey,
    pub ops: Vec<SubDocOp>,
    pub access_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub cas: u64,
    pub deleted: bool,
    pub results: Vec<SubDocResult>,
}

#[derive(Debug, Clone, Default)]
pub struct MutateOptions {
    pub doc: DocKey,
    pub cas: u64,
    pub expiry: u32,
    pub ops: Vec<SubDocOp>,
    pub access_deleted: bool,
    pub create_as_deleted: bool,
    /// Create the document if it does not exist.
    pub mkdoc: bool,
    /// Create the document, failing if it exists.
    pub add: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateResult {
    pub mutation: MutationResult,
    /// Values produced by individual ops (counters), keyed by op index.
    pub values: Vec<(u8, Vec<u8>)>,
}

/// KV operations over one bucket, from the point of view of one node.
#[derive(Debug, Clone)]
pub struct Engine {
    store: Arc<store::Bucket>,
    chrono: Chrono,
    /// Replica index this node holds for each vbucket, `None` if it holds none.
    vb_ownership: Vec<Option<usize>>,
}

impl Engine {
    pub fn new(store: Arc<store::Bucket>, chrono: Chrono, vb_ownership: Vec<Option<usize>>) -> Self {
        Self {
            store,
            chrono,
            vb_ownership,
        }
    }

    pub fn store(&self) -> &Arc<store::Bucket> {
        &self.store
    }

    /// Replica index this node holds for `vbucket`.
    pub fn replica_index(&self, vbucket: u16) -> Option<usize> {
        self.vb_ownership.get(usize::from(vbucket)).copied().flatten()
    }

    fn confirm_active(&self, vbucket: u16) -> Result<(), ProcError> {
        match self.replica_index(vbucket) {
            Some(0) => Ok(()),
            _ => Err(ProcError::NotMyVbucket),
        }
    }

    /// Decode a protocol expiry: 0 is none, up to 30 days is relative,
    /// anything larger is an absolute unix time on the shifted clock.
    pub fn parse_expiry(&self, expiry: u32) -> Option<SystemTime> {
        match expiry {
            0 => None,
            secs if secs > RELATIVE_EXPIRY_LIMIT => {
                Some(UNIX_EPOCH + Duration::from_secs(u64::from(secs)) + self.chrono.time_shift())
            }
            secs => Some(self.chrono.now() + Duration::from_secs(u64::from(secs))),
        }
    }

    /// Lock and CAS rules every write applies to an existing document.
    fn check_write(&self, doc: &Document, cas: u64) -> Result<(), ProcError> {
        if doc.is_locked(self.chrono.now()) && doc.cas != cas {
            return Err(ProcError::Locked);
        }
        if cas != 0 && doc.cas != cas {
            return Err(ProcError::CasMismatch);
        }
        Ok(())
    }

    fn live(current: Option<Document>) -> Result<Document, ProcError> {
        current
            .filter(|doc| !doc.is_deleted)
            .ok_or(ProcError::NotFound)
    }

    fn read(&self, rep_idx: usize, doc: &DocKey) -> Result<Document, ProcError> {
        let found = self
            .store
            .get(rep_idx, doc.vbucket, doc.collection_id, &doc.key)
            .map_err(ProcError::from)?;
        if found.is_deleted {
            return Err(ProcError::NotFound);
        }
        Ok(found)
    }

    pub fn get(&self, doc: &DocKey) -> Result<GetResult, ProcError> {
        self.confirm_active(doc.vbucket)?;
        self.read(0, doc).map(GetResult::from_doc)
    }

    pub fn get_replica(&self, doc: &DocKey) -> Result<GetResult, ProcError> {
        let rep_idx = match self.replica_index(doc.vbucket) {
            Some(idx) if idx >= 1 => idx,
            _ => return Err(ProcError::NotMyVbucket),
        };
        self.read(rep_idx, doc).map(GetResult::from_doc)
    }

    pub fn get_random(&self, collection_id: u32) -> Result<GetResult, ProcError> {
        let mut doc = self
            .store
            .get_random(0, collection_id)
            .ok_or(ProcError::NotFound)?;
        if doc.lock_expiry.is_some() {
            doc.cas = u64::MAX;
        }
        Ok(GetResult::from_doc(doc))
    }

    pub fn get_meta(&self, doc: &DocKey) -> Result<MetaResult, ProcError> {
        self.confirm_active(doc.vbucket)?;
        let found = self
            .store
            .get(0, doc.vbucket, doc.collection_id, &doc.key)
            .map_err(ProcError::from)?;
        Ok(MetaResult {
            cas: found.cas,
            flags: found.flags,
            expiry: found.expiry_secs(),
            rev_id: found.rev_id,
            datatype: found.datatype,
            deleted: found.is_deleted,
        })
    }

    fn new_document(&self, opts: &StoreOptions) -> Document {
        let mut doc = Document::new(opts.doc.vbucket, opts.doc.collection_id, opts.doc.key.clone());
        doc.value = opts.value.clone();
        doc.flags = opts.flags;
        doc.datatype = opts.datatype & !DATATYPE_XATTR;
        doc.expiry = self.parse_expiry(opts.expiry);
        doc.refresh_json_datatype();
        doc
    }

    /// Store a value on `base`, keeping its xattrs.
    fn overwrite(&self, mut base: Document, opts: &StoreOptions) -> Document {
        base.is_deleted = false;
        base.value = opts.value.clone();
        base.flags = opts.flags;
        base.datatype = opts.datatype & !DATATYPE_XATTR;
        base.expiry = self.parse_expiry(opts.expiry);
        base.lock_expiry = None;
        base.refresh_json_datatype();
        base.refresh_xattr_datatype();
        base
    }

    pub fn add(&self, opts: &StoreOptions) -> Result<MutationResult, ProcError> {
        self.confirm_active(opts.doc.vbucket)?;
        let doc = self.new_document(opts);
        let stored = self.store.insert(doc)?;
        Ok(MutationResult::from_doc(&stored))
    }

    pub fn set(&self, opts: &StoreOptions) -> Result<MutationResult, ProcError> {
        self.confirm_active(opts.doc.vbucket)?;
        let key = &opts.doc;
        let stored = self
            .store
            .update(key.vbucket, key.collection_id, &key.key, |current| {
                match current {
                    Some(existing) if !existing.is_deleted => {
                        self.check_write(&existing, opts.cas)?;
                        Ok(self.overwrite(existing, opts))
                    }
                    // A CAS only makes sense against an existing document
                    _ if opts.cas != 0 => Err(ProcError::NotFound),
                    Some(tombstone) => Ok(self.overwrite(tombstone, opts)),
                    None => Ok(self.new_document(opts)),
                }
            })?;
        Ok(MutationResult::from_doc(&stored))
    }

    pub fn replace(&self, opts: &StoreOptions) -> Result<MutationResult, ProcError> {
        self.confirm_active(opts.doc.vbucket)?;
        let key = &opts.doc;
        let stored = self
            .store
            .update(key.vbucket, key.collection_id, &key.key, |current| {
                let existing = Self::live(current)?;
                self.check_write(&existing, opts.cas)?;
                Ok::<Document, ProcError>(self.overwrite(existing, opts))
            })?;
        Ok(MutationResult::from_doc(&stored))
    }

    pub fn delete(&self, doc: &DocKey, cas: u64) -> Result<MutationResult, ProcError> {
        self.confirm_active(doc.vbucket)?;
        let stored = self
            .store
            .update(doc.vbucket, doc.collection_id, &doc.key, |current| {
                let mut existing = Self::live(current)?;
                self.check_write(&existing, cas)?;
                existing.is_deleted = true;
                existing.value.clear();
                existing.xattrs.retain(|name, _| name.starts_with('_'));
                existing.datatype = 0;
                existing.expiry = None;
                existing.lock_expiry = None;
                existing.refresh_xattr_datatype();
                Ok::<Document, ProcError>(existing)
            })?;
        Ok(MutationResult::from_doc(&stored))
    }

    fn counter(&self, opts: &CounterOptions, increment: bool) -> Result<CounterResult, ProcError> {
        self.confirm_active(opts.doc.vbucket)?;
        let key = &opts.doc;
        let stored = self
            .store
            .update(key.vbucket, key.collection_id, &key.key, |current| {
                let Some(mut existing) = current.filter(|doc| !doc.is_deleted) else {
                    if opts.expiry == COUNTER_NO_CREATE || opts.cas != 0 {
                        return Err(ProcError::NotFound);
                    }
                    let mut doc = Document::new(key.vbucket, key.collection_id, key.key.clone());
                    doc.value = opts.initial.to_string().into_bytes();
                    doc.expiry = self.parse_expiry(opts.expiry);
                    doc.refresh_json_datatype();
                    return Ok(doc);
                };
                self.check_write(&existing, opts.cas)?;

                let current_value = std::str::from_utf8(&existing.value)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or(ProcError::BadDelta)?;
                let next = if increment {
                    current_value.saturating_add(opts.delta)
                } else {
                    current_value.saturating_sub(opts.delta)
                };
                existing.value = next.to_string().into_bytes();
                existing.lock_expiry = None;
                if opts.expiry != 0 && opts.expiry != COUNTER_NO_CREATE {
                    existing.expiry = self.parse_expiry(opts.expiry);
                }
                existing.refresh_json_datatype();
                Ok(existing)
            })?;

        let value = std::str::from_utf8(&stored.value)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_default();
        Ok(CounterResult {
            value,
            mutation: MutationResult::from_doc(&stored),
        })
    }

    pub fn increment(&self, opts: &CounterOptions) -> Result<CounterResult, ProcError> {
        self.counter(opts, true)
    }

    pub fn decrement(&self, opts: &CounterOptions) -> Result<CounterResult, ProcError> {
        self.counter(opts, false)
    }

    fn adjoin(&self, opts: &StoreOptions, append: bool) -> Result<MutationResult, ProcError> {
        self.confirm_active(opts.doc.vbucket)?;
        let key = &opts.doc;
        let stored = self
            .store
            .update(key.vbucket, key.collection_id, &key.key, |current| {
                let mut existing = Self::live(current)?;
                self.check_write(&existing, opts.cas)?;
                if append {
                    existing.value.extend_from_slice(&opts.value);
                } else {
                    let mut value = opts.value.clone();
                    value.append(&mut existing.value);
                    existing.value = value;
                }
                existing.lock_expiry = None;
                existing.refresh_json_datatype();
                Ok::<Document, ProcError>(existing)
            })?;
        Ok(MutationResult::from_doc(&stored))
    }

    pub fn append(&self, opts: &StoreOptions) -> Result<MutationResult, ProcError> {
        self.adjoin(opts, true)
    }

    pub fn prepend(&self, opts: &StoreOptions) -> Result<MutationResult, ProcError> {
        self.adjoin(opts, false)
    }

    fn touch_doc(&self, doc: &DocKey, expiry: u32) -> Result<Document, ProcError> {
        self.confirm_active(doc.vbucket)?;
        self.store
            .update(doc.vbucket, doc.collection_id, &doc.key, |current| {
                let mut existing = Self::live(current)?;
                if existing.is_locked(self.chrono.now()) {
                    return Err(ProcError::Locked);
                }
                existing.expiry = self.parse_expiry(expiry);
                Ok(existing)
            })
    }

    pub fn touch(&self, doc: &DocKey, expiry: u32) -> Result<MutationResult, ProcError> {
        self.touch_doc(doc, expiry).map(|stored| MutationResult::from_doc(&stored))
    }

    pub fn get_and_touch(&self, doc: &DocKey, expiry: u32) -> Result<GetResult, ProcError> {
        self.touch_doc(doc, expiry).map(GetResult::from_doc)
    }

    /// Lock a document for `lock_time` seconds (0 means the default) and return it.
    /// The returned CAS is the only one that can modify the document until unlocked.
    pub fn get_locked(&self, doc: &DocKey, lock_time: u32) -> Result<GetResult, ProcError> {
        self.confirm_active(doc.vbucket)?;
        let lock_time = if lock_time == 0 { DEFAULT_LOCK_TIME } else { lock_time };
        let until = self.chrono.now() + Duration::from_secs(u64::from(lock_time));

        let stored = self
            .store
            .update(doc.vbucket, doc.collection_id, &doc.key, |current| {
                let mut existing = Self::live(current)?;
                if existing.is_locked(self.chrono.now()) {
                    return Err(ProcError::Locked);
                }
                existing.lock_expiry = Some(until);
                Ok(existing)
            })?;
        Ok(GetResult::from_doc(stored))
    }

    /// Release a lock. The CAS must be the one GET_LOCKED returned and is kept.
    pub fn unlock(&self, doc: &DocKey, cas: u64) -> Result<MutationResult, ProcError> {
        self.confirm_active(doc.vbucket)?;
        let stored = self
            .store
            .update_keep_cas(doc.vbucket, doc.collection_id, &doc.key, |current| {
                let mut existing = Self::live(current)?;
                if !existing.is_locked(self.chrono.now()) {
                    return Err(ProcError::NotLocked);
                }
                if existing.cas != cas {
                    return Err(ProcError::Locked);
                }
                existing.lock_expiry = None;
                Ok(existing)
            })?;
        Ok(MutationResult::from_doc(&stored))
    }

    /// Sequence numbers visible from this node's copy of `vbucket`.
    pub fn observe_seq_no(&self, vbucket: u16) -> Result<MetaState, ProcError> {
        let rep_idx = self.replica_index(vbucket).ok_or(ProcError::NotMyVbucket)?;
        let vb = self.store.vbucket(vbucket)?;
        Ok(vb.current_meta_state(rep_idx))
    }

    pub fn multi_lookup(&self, opts: &LookupOptions) -> Result<LookupResult, ProcError> {
        self.confirm_active(opts.doc.vbucket)?;
        subdoc::validate_batch(&opts.ops, false)?;

        let key = &opts.doc;
        let doc = self
            .store
            .get(0, key.vbucket, key.collection_id, &key.key)
            .map_err(ProcError::from)?;
        if doc.is_deleted && !opts.access_deleted {
            return Err(ProcError::NotFound);
        }

        let mut exec = subdoc::Executor::new(&doc, self.chrono.now(), 0);
        let results = exec.run_all(&opts.ops);
        Ok(LookupResult {
            cas: doc.cas,
            deleted: doc.is_deleted,
            results,
        })
    }

    /// Apply a batch of sub-document mutations atomically: either every op
    /// succeeds and one new version is stored, or nothing changes.
    pub fn multi_mutate(&self, opts: &MutateOptions) -> Result<MutateResult, ProcError> {
        self.confirm_active(opts.doc.vbucket)?;
        subdoc::validate_batch(&opts.ops, true)?;
        if opts.create_as_deleted && !opts.access_deleted {
            return Err(ProcError::InvalidArgs("create-as-deleted requires access-deleted"));
        }

        let creating = opts.mkdoc || opts.add;
        let ops: Vec<SubDocOp> = if creating {
            opts.ops
                .iter()
                .cloned()
                .map(|op| {
                    let flags = op.flags | crate::memd::SUBDOC_FLAG_MKDIR_P;
                    op.with_flags(flags)
                })
                .collect()
        } else {
            opts.ops.clone()
        };

        let key = &opts.doc;
        let vb = self.store.vbucket(key.vbucket)?;
        for _ in 0..MULTI_MUTATE_ATTEMPTS {
            let current = match vb.get(0, key.collection_id, &key.key) {
                Ok(doc) => Some(doc),
                Err(StoreError::NotFound) => None,
                Err(err) => return Err(err.into()),
            };
            let base_cas = current.as_ref().map(|doc| doc.cas);

            let base = match current {
                Some(doc) if !doc.is_deleted => {
                    if opts.add {
                        return Err(ProcError::Exists);
                    }
                    self.check_write(&doc, opts.cas)?;
                    doc
                }
                Some(tombstone) if opts.access_deleted && !creating => {
                    if opts.cas != 0 && tombstone.cas != opts.cas {
                        return Err(ProcError::CasMismatch);
                    }
                    tombstone
                }
                existing => {
                    if !creating || opts.cas != 0 {
                        return Err(ProcError::NotFound);
                    }
                    let mut doc = existing.unwrap_or_else(|| {
                        Document::new(key.vbucket, key.collection_id, key.key.clone())
                    });
                    doc.is_deleted = opts.create_as_deleted;
                    doc.value = subdoc::initial_body(&ops);
                    doc.flags = 0;
                    doc
                }
            };

            let mut values = Vec::new();
            let result = self.store.update_with_cas(
                key.vbucket,
                key.collection_id,
                &key.key,
                |latest: Option<Document>, new_cas| {
                    if latest.as_ref().map(|doc| doc.cas) != base_cas {
                        return Err(ProcError::CasMismatch);
                    }
                    let mut exec = subdoc::Executor::new(&base, self.chrono.now(), new_cas);
                    for (index, op) in ops.iter().enumerate() {
                        let index = u8::try_from(index).unwrap_or(u8::MAX);
                        match exec.execute(op) {
                            Ok(value) if !value.is_empty() && op.is_mutation() => {
                                values.push((index, value))
                            }
                            Ok(_) => {}
                            Err(error) => return Err(ProcError::MultiFailure { index, error }),
                        }
                    }
                    let done = exec.finish();

                    let mut next = base.clone();
                    next.value = done.value;
                    next.xattrs = done.xattrs;
                    next.is_deleted = done.deleted;
                    next.cas = new_cas;
                    next.lock_expiry = None;
                    if opts.expiry != 0 || base_cas.is_none() {
                        next.expiry = self.parse_expiry(opts.expiry);
                    }
                    next.refresh_json_datatype();
                    next.refresh_xattr_datatype();
                    Ok(next)
                },
            );

            match result {
                Ok(stored) => {
                    return Ok(MutateResult {
                        mutation: MutationResult::from_doc(&stored),
                        values,
                    });
                }
                // Someone else wrote in between; a caller supplied CAS can never match now
                Err(ProcError::CasMismatch) if opts.cas == 0 => continue,
                Err(err) => return Err(err),
            }
        }
        Err(ProcError::TooManyTries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memd::{OpCode, SUBDOC_FLAG_XATTR_PATH};
    use crate::store::BucketOptions;

    fn engine_with(replica: Option<usize>) -> (Engine, Chrono) {
        let chrono = Chrono::new();
        let store = store::Bucket::new(BucketOptions {
            chrono: chrono.clone(),
            num_vbuckets: 4,
            replica_latency: Duration::from_millis(50),
            persist_latency: Duration::from_millis(100),
        })
        .unwrap();
        let engine = Engine::new(Arc::new(store), chrono.clone(), vec![replica; 4]);
        (engine, chrono)
    }

    fn engine() -> (Engine, Chrono) {
        engine_with(Some(0))
    }

    fn store_opts(key: &str, value: &str) -> StoreOptions {
        StoreOptions {
            doc: DocKey::new(1, 0, key),
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let (engine, _) = engine();
        let mut opts = store_opts("k", r#"{"a":1}"#);
        opts.flags = 0x0200_0006;
        let added = engine.add(&opts).unwrap();
        assert_ne!(added.cas, 0);

        let got = engine.get(&opts.doc).unwrap();
        assert_eq!(got.value, br#"{"a":1}"#.to_vec());
        assert_eq!(got.flags, 0x0200_0006);
        assert_eq!(got.cas, added.cas);
        assert_eq!(got.datatype, crate::store::DATATYPE_JSON);

        assert_eq!(engine.add(&opts), Err(ProcError::Exists));
    }

    #[test]
    fn set_honours_cas() {
        let (engine, _) = engine();
        let first = engine.set(&store_opts("k", "1")).unwrap();

        let mut stale = store_opts("k", "2");
        stale.cas = first.cas + 1;
        assert_eq!(engine.set(&stale), Err(ProcError::CasMismatch));

        stale.cas = first.cas;
        let second = engine.set(&stale).unwrap();
        assert!(second.cas > first.cas);
        assert_eq!(engine.get(&stale.doc).unwrap().value, b"2".to_vec());

        let mut missing = store_opts("other", "x");
        missing.cas = 5;
        assert_eq!(engine.set(&missing), Err(ProcError::NotFound));
    }

    #[test]
    fn ownership_is_enforced() {
        let (engine, _) = engine_with(Some(1));
        assert_eq!(engine.set(&store_opts("k", "1")), Err(ProcError::NotMyVbucket));
        assert_eq!(engine.get_replica(&DocKey::new(1, 0, "k")), Err(ProcError::NotFound));

        let (engine, _) = engine_with(None);
        assert_eq!(engine.observe_seq_no(1), Err(ProcError::NotMyVbucket));
    }

    #[test]
    fn replace_and_delete() {
        let (engine, _) = engine();
        assert_eq!(engine.replace(&store_opts("k", "1")), Err(ProcError::NotFound));
        engine.add(&store_opts("k", "1")).unwrap();
        engine.replace(&store_opts("k", "2")).unwrap();

        let doc = DocKey::new(1, 0, "k");
        engine.delete(&doc, 0).unwrap();
        assert_eq!(engine.get(&doc), Err(ProcError::NotFound));
        assert_eq!(engine.delete(&doc, 0), Err(ProcError::NotFound));
        assert!(engine.get_meta(&doc).unwrap().deleted);
        // A deleted key can be added again
        engine.add(&store_opts("k", "3")).unwrap();
    }

    #[test]
    fn counters_create_and_saturate() {
        let (engine, _) = engine();
        let mut opts = CounterOptions {
            doc: DocKey::new(1, 0, "c"),
            delta: 5,
            initial: 10,
            expiry: COUNTER_NO_CREATE,
            ..Default::default()
        };
        assert_eq!(engine.increment(&opts), Err(ProcError::NotFound));

        opts.expiry = 0;
        assert_eq!(engine.increment(&opts).unwrap().value, 10);
        assert_eq!(engine.increment(&opts).unwrap().value, 15);
        assert_eq!(engine.decrement(&opts).unwrap().value, 10);

        opts.delta = u64::MAX;
        assert_eq!(engine.increment(&opts).unwrap().value, u64::MAX);
        assert_eq!(engine.decrement(&opts).unwrap().value, 0);

        engine.set(&store_opts("text", "abc")).unwrap();
        opts.doc = DocKey::new(1, 0, "text");
        assert_eq!(engine.increment(&opts), Err(ProcError::BadDelta));
    }

    #[test]
    fn append_and_prepend() {
        let (engine, _) = engine();
        assert_eq!(engine.append(&store_opts("k", "x")), Err(ProcError::NotFound));
        engine.set(&store_opts("k", "mid")).unwrap();
        engine.append(&store_opts("k", "-end")).unwrap();
        engine.prepend(&store_opts("k", "start-")).unwrap();
        assert_eq!(engine.get(&DocKey::new(1, 0, "k")).unwrap().value, b"start-mid-end".to_vec());
    }

    #[test]
    fn locking_masks_cas_until_unlocked() {
        let (engine, chrono) = engine();
        engine.set(&store_opts("k", "v")).unwrap();
        let doc = DocKey::new(1, 0, "k");

        let locked = engine.get_locked(&doc, 0).unwrap();
        assert_eq!(engine.get(&doc).unwrap().cas, u64::MAX);
        assert_eq!(engine.set(&store_opts("k", "w")), Err(ProcError::Locked));
        assert_eq!(engine.get_locked(&doc, 0), Err(ProcError::Locked));
        assert_eq!(engine.unlock(&doc, locked.cas + 1), Err(ProcError::Locked));

        let unlocked = engine.unlock(&doc, locked.cas).unwrap();
        assert_eq!(unlocked.cas, locked.cas);
        assert_eq!(engine.get(&doc).unwrap().cas, locked.cas);
        assert_eq!(engine.unlock(&doc, locked.cas), Err(ProcError::NotLocked));

        // Locks lapse once logical time passes the default lock time
        engine.get_locked(&doc, 0).unwrap();
        chrono.time_travel(Duration::from_secs(u64::from(DEFAULT_LOCK_TIME) + 1));
        assert_ne!(engine.get(&doc).unwrap().cas, u64::MAX);
        engine.set(&store_opts("k", "after")).unwrap();
    }

    #[test]
    fn locked_doc_accepts_lock_cas() {
        let (engine, _) = engine();
        engine.set(&store_opts("k", "v")).unwrap();
        let locked = engine.get_locked(&DocKey::new(1, 0, "k"), 5).unwrap();
        let mut opts = store_opts("k", "w");
        opts.cas = locked.cas;
        engine.set(&opts).unwrap();
        assert_ne!(engine.get(&opts.doc).unwrap().cas, u64::MAX);
    }

    #[test]
    fn expiry_hides_documents() {
        let (engine, chrono) = engine();
        let mut opts = store_opts("k", "v");
        opts.expiry = 10;
        engine.set(&opts).unwrap();
        assert!(engine.get(&opts.doc).is_ok());

        chrono.time_travel(Duration::from_secs(11));
        assert_eq!(engine.get(&opts.doc), Err(ProcError::NotFound));
    }

    #[test]
    fn touch_updates_expiry() {
        let (engine, chrono) = engine();
        engine.set(&store_opts("k", "v")).unwrap();
        let doc = DocKey::new(1, 0, "k");
        engine.touch(&doc, 5).unwrap();
        assert!(engine.get_meta(&doc).unwrap().expiry > 0);
        let got = engine.get_and_touch(&doc, 0).unwrap();
        assert_eq!(got.value, b"v".to_vec());
        chrono.time_travel(Duration::from_secs(10));
        assert!(engine.get(&doc).is_ok());
    }

    #[test]
    fn absolute_expiry_uses_shifted_clock() {
        let (engine, chrono) = engine();
        chrono.time_travel(Duration::from_secs(100));
        let at = engine.parse_expiry(RELATIVE_EXPIRY_LIMIT + 1).unwrap();
        let expected = UNIX_EPOCH
            + Duration::from_secs(u64::from(RELATIVE_EXPIRY_LIMIT) + 1)
            + Duration::from_secs(100);
        assert_eq!(at, expected);
        assert_eq!(engine.parse_expiry(0), None);
    }

    #[test]
    fn replica_reads_lag_behind() {
        let chrono = Chrono::new();
        let store = Arc::new(
            store::Bucket::new(BucketOptions {
                chrono: chrono.clone(),
                num_vbuckets: 4,
                replica_latency: Duration::from_millis(50),
                persist_latency: Duration::from_millis(100),
            })
            .unwrap(),
        );
        let active = Engine::new(store.clone(), chrono.clone(), vec![Some(0); 4]);
        let replica = Engine::new(store, chrono.clone(), vec![Some(1); 4]);

        let stored = active.add(&store_opts("k", "v")).unwrap();
        let doc = DocKey::new(1, 0, "k");
        assert_eq!(replica.get_replica(&doc), Err(ProcError::NotFound));

        chrono.time_travel(Duration::from_millis(100));
        assert_eq!(replica.get_replica(&doc).unwrap().cas, stored.cas);
        assert!(replica.observe_seq_no(1).unwrap().current_seq_no >= stored.seq_no);
    }

    #[test]
    fn multi_mutate_creates_document() {
        let (engine, _) = engine();
        let opts = MutateOptions {
            doc: DocKey::new(1, 0, "sd"),
            ops: vec![SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "a.b.c", "42")],
            mkdoc: true,
            ..Default::default()
        };
        engine.multi_mutate(&opts).unwrap();
        assert_eq!(
            engine.get(&opts.doc).unwrap().value,
            br#"{"a":{"b":{"c":42}}}"#.to_vec()
        );

        let mut add = opts.clone();
        add.mkdoc = false;
        add.add = true;
        assert_eq!(engine.multi_mutate(&add), Err(ProcError::Exists));
    }

    #[test]
    fn failed_multi_mutate_leaves_document_untouched() {
        let (engine, _) = engine();
        engine.set(&store_opts("sd", r#"{"a":1}"#)).unwrap();
        let before = engine.get(&DocKey::new(1, 0, "sd")).unwrap();

        let opts = MutateOptions {
            doc: DocKey::new(1, 0, "sd"),
            ops: vec![
                SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "b", "2"),
                SubDocOp::new(OpCode::SUBDOC_REPLACE, "missing", "3"),
            ],
            ..Default::default()
        };
        assert_eq!(
            engine.multi_mutate(&opts),
            Err(ProcError::MultiFailure {
                index: 1,
                error: SubDocError::PathNotFound
            })
        );
        assert_eq!(engine.get(&opts.doc).unwrap(), before);
    }

    #[test]
    fn multi_mutate_reports_counter_values() {
        let (engine, _) = engine();
        engine.set(&store_opts("sd", r#"{"n":1}"#)).unwrap();
        let opts = MutateOptions {
            doc: DocKey::new(1, 0, "sd"),
            ops: vec![
                SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "x", "true"),
                SubDocOp::new(OpCode::SUBDOC_COUNTER, "n", "2"),
            ],
            ..Default::default()
        };
        let result = engine.multi_mutate(&opts).unwrap();
        assert_eq!(result.values, vec![(1, b"3".to_vec())]);
    }

    #[test]
    fn expanded_cas_macro_matches_stored_cas() {
        let (engine, _) = engine();
        let doc = DocKey::new(1, 0, "sd");
        let opts = MutateOptions {
            doc: doc.clone(),
            ops: vec![SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "txn.cas", r#""${Mutation.CAS}""#)
                .with_flags(SUBDOC_FLAG_XATTR_PATH | crate::memd::SUBDOC_FLAG_EXPAND_MACROS)],
            mkdoc: true,
            ..Default::default()
        };
        let stored = engine.multi_mutate(&opts).unwrap().mutation;

        let lookup = LookupOptions {
            doc,
            ops: vec![SubDocOp::new(OpCode::SUBDOC_GET, "txn.cas", "").with_flags(SUBDOC_FLAG_XATTR_PATH)],
            access_deleted: false,
        };
        let expected = format!("\"0x{:016x}\"", stored.cas.swap_bytes());
        assert_eq!(engine.multi_lookup(&lookup).unwrap().results, vec![Ok(expected.into_bytes())]);
    }

    #[test]
    fn subdoc_and_plain_writes_keep_cas_in_seqno_order() {
        let (engine, _) = engine();
        let engine = Arc::new(engine);
        engine.set(&store_opts("sd", r#"{"n":0}"#)).unwrap();

        let counters = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let opts = MutateOptions {
                    doc: DocKey::new(1, 0, "sd"),
                    ops: vec![SubDocOp::new(OpCode::SUBDOC_COUNTER, "n", "1")],
                    ..Default::default()
                };
                for _ in 0..300 {
                    // Retries may run out under contention; ordering is what matters here
                    let _ = engine.multi_mutate(&opts);
                }
            })
        };
        let setters = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for i in 0..300 {
                    engine.set(&store_opts(&format!("other-{i}"), "{}")).unwrap();
                }
            })
        };
        counters.join().unwrap();
        setters.join().unwrap();

        let vb = engine.store().vbucket(1).unwrap();
        let (docs, _) = vb.get_all_within(0, vb.max_seq_no()).unwrap();
        for pair in docs.windows(2) {
            assert!(pair[0].cas < pair[1].cas, "CAS out of order at seqno {}", pair[1].seq_no);
            assert!(pair[0].modified <= pair[1].modified);
        }
    }

    #[test]
    fn lookups_see_xattrs_and_deleted_docs() {
        let (engine, _) = engine();
        let doc = DocKey::new(1, 0, "sd");
        let mutate = MutateOptions {
            doc: doc.clone(),
            ops: vec![SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "_txn.id", r#""abc""#)
                .with_flags(SUBDOC_FLAG_XATTR_PATH)],
            mkdoc: true,
            access_deleted: true,
            create_as_deleted: true,
            ..Default::default()
        };
        engine.multi_mutate(&mutate).unwrap();
        assert_eq!(engine.get(&doc), Err(ProcError::NotFound));

        let mut lookup = LookupOptions {
            doc: doc.clone(),
            ops: vec![SubDocOp::new(OpCode::SUBDOC_GET, "_txn.id", "").with_flags(SUBDOC_FLAG_XATTR_PATH)],
            access_deleted: false,
        };
        assert_eq!(engine.multi_lookup(&lookup), Err(ProcError::NotFound));

        lookup.access_deleted = true;
        let result = engine.multi_lookup(&lookup).unwrap();
        assert!(result.deleted);
        assert_eq!(result.results, vec![Ok(br#""abc""#.to_vec())]);
    }

    #[test]
    fn get_random_finds_a_document() {
        let (engine, _) = engine();
        assert_eq!(engine.get_random(0), Err(ProcError::NotFound));
        engine.set(&store_opts("k", "v")).unwrap();
        assert_eq!(engine.get_random(0).unwrap().key, b"k".to_vec());
    }
}
