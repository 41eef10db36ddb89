use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Datatype bit: value is JSON.
pub const DATATYPE_JSON: u8 = 0x01;
/// Datatype bit: value is snappy compressed.
pub const DATATYPE_SNAPPY: u8 = 0x02;
/// Datatype bit: value carries extended attributes.
pub const DATATYPE_XATTR: u8 = 0x04;

/// One version of a document in a vbucket log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub vb_id: u16,
    pub collection_id: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Extended attributes, each value a serialized JSON fragment.
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub flags: u32,
    pub datatype: u8,
    pub is_deleted: bool,
    pub expiry: Option<SystemTime>,
    pub lock_expiry: Option<SystemTime>,
    pub vb_uuid: u64,
    pub cas: u64,
    pub seq_no: u64,
    pub modified: SystemTime,
    pub rev_id: u64,
}

impl Document {
    /// Fresh, empty document for a key.
    pub fn new(vb_id: u16, collection_id: u32, key: impl Into<Vec<u8>>) -> Self {
        Self {
            vb_id,
            collection_id,
            key: key.into(),
            value: Vec::new(),
            xattrs: BTreeMap::new(),
            flags: 0,
            datatype: 0,
            is_deleted: false,
            expiry: None,
            lock_expiry: None,
            vb_uuid: 0,
            cas: 0,
            seq_no: 0,
            modified: UNIX_EPOCH,
            rev_id: 0,
        }
    }

    pub fn is_locked(&self, now: SystemTime) -> bool {
        self.lock_expiry.is_some_and(|until| until > now)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiry.is_some_and(|at| at <= now)
    }

    /// Sets or clears the JSON datatype bit depending on whether the value parses.
    pub fn refresh_json_datatype(&mut self) {
        if !self.value.is_empty() && serde_json::from_slice::<serde_json::Value>(&self.value).is_ok() {
            self.datatype |= DATATYPE_JSON;
        } else {
            self.datatype &= !DATATYPE_JSON;
        }
    }

    /// Sets or clears the xattr datatype bit to match the attribute map.
    pub fn refresh_xattr_datatype(&mut self) {
        if self.xattrs.is_empty() {
            self.datatype &= !DATATYPE_XATTR;
        } else {
            self.datatype |= DATATYPE_XATTR;
        }
    }

    /// Expiry as unix seconds, 0 when none.
    pub fn expiry_secs(&self) -> u32 {
        self.expiry
            .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
            .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    /// Presentation of the document as a reader at `now` should see it:
    /// expired documents become tombstones and elapsed locks disappear.
    pub(crate) fn view_at(mut self, now: SystemTime) -> Self {
        if !self.is_deleted && self.is_expired(now) {
            self.is_deleted = true;
            self.value.clear();
            self.xattrs.retain(|name, _| name.starts_with('_'));
            self.datatype = 0;
            self.refresh_xattr_datatype();
        }
        if self.lock_expiry.is_some_and(|until| until <= now) {
            self.lock_expiry = None;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expired_view_is_a_tombstone() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let mut doc = Document::new(0, 0, "key");
        doc.value = b"{\"a\":1}".to_vec();
        doc.datatype = DATATYPE_JSON;
        doc.expiry = Some(now - Duration::from_secs(1));
        doc.xattrs.insert("_sync".into(), b"1".to_vec());
        doc.xattrs.insert("user".into(), b"2".to_vec());

        let view = doc.view_at(now);
        assert!(view.is_deleted);
        assert!(view.value.is_empty());
        assert_eq!(view.xattrs.len(), 1);
        assert_eq!(view.datatype, DATATYPE_XATTR);
    }

    #[test]
    fn elapsed_lock_is_cleared() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let mut doc = Document::new(0, 0, "key");
        doc.lock_expiry = Some(now);
        assert!(!doc.is_locked(now));
        assert!(doc.view_at(now).lock_expiry.is_none());
    }

    #[test]
    fn json_datatype_follows_value() {
        let mut doc = Document::new(0, 0, "key");
        doc.value = b"[1,2]".to_vec();
        doc.refresh_json_datatype();
        assert_eq!(doc.datatype & DATATYPE_JSON, DATATYPE_JSON);

        doc.value = b"not json".to_vec();
        doc.refresh_json_datatype();
        assert_eq!(doc.datatype & DATATYPE_JSON, 0);
    }
}
