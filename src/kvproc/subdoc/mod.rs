//! Sub-document execution: runs a batch of path operations against a
//! working copy of a document, including its extended attributes.

pub mod manip;
pub mod path;

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};

use self::path::PathComponent;
use super::error::SubDocError;
use crate::memd::{
    OpCode, SUBDOC_FLAG_EXPAND_MACROS, SUBDOC_FLAG_MKDIR_P, SUBDOC_FLAG_XATTR_PATH,
};
use crate::store::{DATATYPE_JSON, DATATYPE_SNAPPY, DATATYPE_XATTR, Document};

/// Most operations accepted in one multi-lookup or multi-mutation.
pub const MAX_OPS: usize = 16;

const MACRO_CAS: &str = "${Mutation.CAS}";
const MACRO_VALUE_CRC32C: &str = "${Mutation.value_crc32c}";

/// One operation of a multi-path request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDocOp {
    pub opcode: OpCode,
    pub flags: u8,
    pub path: String,
    pub value: Vec<u8>,
}

impl SubDocOp {
    pub fn new(opcode: OpCode, path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            flags: 0,
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_xattr(&self) -> bool {
        self.flags & SUBDOC_FLAG_XATTR_PATH != 0
    }

    pub fn mkdir_p(&self) -> bool {
        self.flags & SUBDOC_FLAG_MKDIR_P != 0
    }

    pub fn expand_macros(&self) -> bool {
        self.flags & SUBDOC_FLAG_EXPAND_MACROS != 0
    }

    pub fn is_lookup(&self) -> bool {
        matches!(
            self.opcode,
            OpCode::SUBDOC_GET | OpCode::SUBDOC_EXISTS | OpCode::SUBDOC_GET_COUNT | OpCode::SUBDOC_GET_DOC
        )
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self.opcode,
            OpCode::SUBDOC_DICT_ADD
                | OpCode::SUBDOC_DICT_UPSERT
                | OpCode::SUBDOC_DELETE
                | OpCode::SUBDOC_REPLACE
                | OpCode::SUBDOC_ARRAY_PUSH_LAST
                | OpCode::SUBDOC_ARRAY_PUSH_FIRST
                | OpCode::SUBDOC_ARRAY_INSERT
                | OpCode::SUBDOC_ARRAY_ADD_UNIQUE
                | OpCode::SUBDOC_COUNTER
                | OpCode::SUBDOC_SET_DOC
                | OpCode::SUBDOC_DELETE_DOC
        )
    }
}

/// Per-operation outcome: the returned value (possibly empty) or the path error.
pub type SubDocResult = Result<Vec<u8>, SubDocError>;

/// Check batch-level rules shared by lookups and mutations.
pub fn validate_batch(ops: &[SubDocOp], mutation: bool) -> Result<(), SubDocError> {
    if ops.is_empty() || ops.len() > MAX_OPS {
        return Err(SubDocError::BadCombo);
    }
    let mut seen_body = false;
    for op in ops {
        let allowed = if mutation { op.is_mutation() } else { op.is_lookup() };
        if !allowed {
            return Err(SubDocError::BadCombo);
        }
        if op.expand_macros() && !op.is_xattr() {
            return Err(SubDocError::XattrInvalidFlagCombo);
        }
        if op.is_xattr() {
            if seen_body {
                return Err(SubDocError::InvalidXattrOrder);
            }
        } else {
            seen_body = true;
        }
    }
    Ok(())
}

/// Starting body for a document created by a mutation batch: an array when
/// the first body operation addresses an array root, an object otherwise.
pub fn initial_body(ops: &[SubDocOp]) -> Vec<u8> {
    let root_is_array = ops.iter().find(|op| !op.is_xattr()).is_some_and(|op| {
        let trimmed = op.path.trim();
        trimmed.starts_with('[')
            || (trimmed.is_empty()
                && matches!(
                    op.opcode,
                    OpCode::SUBDOC_ARRAY_PUSH_FIRST
                        | OpCode::SUBDOC_ARRAY_PUSH_LAST
                        | OpCode::SUBDOC_ARRAY_ADD_UNIQUE
                ))
    });
    if root_is_array { b"[]".to_vec() } else { b"{}".to_vec() }
}

#[derive(Debug)]
enum Body {
    Json(Value),
    Raw(Vec<u8>),
}

/// Working copy of a document that a batch of operations runs against.
#[derive(Debug)]
pub struct Executor {
    original: Document,
    now: SystemTime,
    new_cas: u64,
    body: Body,
    body_dirty: bool,
    xattrs: BTreeMap<String, Vec<u8>>,
    deleted: bool,
    deferred_crc: Vec<(String, Vec<PathComponent>)>,
}

/// Final state of an executed batch.
#[derive(Debug)]
pub struct ExecutedDoc {
    pub value: Vec<u8>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub deleted: bool,
}

impl Executor {
    /// `new_cas` is the CAS the mutation will be stored with, used for macro expansion.
    pub fn new(doc: &Document, now: SystemTime, new_cas: u64) -> Self {
        let body = match serde_json::from_slice::<Value>(&doc.value) {
            Ok(value) if !doc.value.is_empty() => Body::Json(value),
            _ => Body::Raw(doc.value.clone()),
        };
        Self {
            original: doc.clone(),
            now,
            new_cas,
            body,
            body_dirty: false,
            xattrs: doc.xattrs.clone(),
            deleted: doc.is_deleted,
            deferred_crc: Vec::new(),
        }
    }

    /// Run every op, collecting individual outcomes.
    pub fn run_all(&mut self, ops: &[SubDocOp]) -> Vec<SubDocResult> {
        ops.iter().map(|op| self.execute(op)).collect()
    }

    pub fn execute(&mut self, op: &SubDocOp) -> SubDocResult {
        if op.is_xattr() {
            self.execute_xattr(op)
        } else {
            self.execute_body(op)
        }
    }

    fn execute_body(&mut self, op: &SubDocOp) -> SubDocResult {
        let empty_path = op.path.trim().is_empty();
        match op.opcode {
            OpCode::SUBDOC_GET_DOC if empty_path => return Ok(self.body_bytes()),
            OpCode::SUBDOC_SET_DOC if empty_path => {
                self.body = match serde_json::from_slice::<Value>(&op.value) {
                    Ok(value) => Body::Json(value),
                    Err(_) => Body::Raw(op.value.clone()),
                };
                self.body_dirty = true;
                self.deleted = false;
                return Ok(Vec::new());
            }
            OpCode::SUBDOC_DELETE_DOC if empty_path => {
                self.body = Body::Raw(Vec::new());
                self.body_dirty = true;
                self.deleted = true;
                self.xattrs.retain(|name, _| name.starts_with('_'));
                return Ok(Vec::new());
            }
            OpCode::SUBDOC_GET_DOC | OpCode::SUBDOC_SET_DOC | OpCode::SUBDOC_DELETE_DOC => {
                return Err(SubDocError::PathInvalid);
            }
            _ => {}
        }

        let path = path::parse(&op.path)?;
        let Body::Json(root) = &mut self.body else {
            return Err(SubDocError::NotJson);
        };
        let value = run_op(root, op, &path, None)?;
        if op.is_mutation() {
            self.body_dirty = true;
        }
        Ok(value)
    }

    fn execute_xattr(&mut self, op: &SubDocOp) -> SubDocResult {
        let path = path::parse(&op.path)?;
        let key = path
            .first()
            .and_then(PathComponent::as_field)
            .ok_or(SubDocError::XattrInvalidKeyCombo)?
            .to_string();

        if key.starts_with('$') {
            if op.is_mutation() {
                return Err(SubDocError::XattrCannotModifyVattr);
            }
            let mut root = keyed(&key, self.virtual_attribute(&key)?);
            return run_op(&mut root, op, &path, None);
        }

        let mut root = match self.xattrs.get(&key) {
            Some(raw) => keyed(&key, serde_json::from_slice(raw).map_err(|_| SubDocError::NotJson)?),
            None => Value::Object(Map::new()),
        };

        let expanded = if op.expand_macros() {
            self.expand_macro(&op.value, &key, &path)?
        } else {
            None
        };
        let result = run_op(&mut root, op, &path, expanded)?;

        if op.is_mutation() {
            match root.get(&key) {
                Some(value) => {
                    let encoded = serde_json::to_vec(value).map_err(|_| SubDocError::CantInsert)?;
                    self.xattrs.insert(key, encoded);
                }
                None => {
                    self.xattrs.remove(&key);
                }
            }
        }
        Ok(result)
    }

    /// Resolve a macro value. Returns `None` when the value is not a macro.
    fn expand_macro(
        &mut self,
        raw: &[u8],
        key: &str,
        path: &[PathComponent],
    ) -> Result<Option<Value>, SubDocError> {
        let Ok(Value::String(text)) = serde_json::from_slice::<Value>(raw) else {
            return Ok(None);
        };
        match text.as_str() {
            MACRO_CAS => Ok(Some(Value::String(format!("0x{:016x}", self.new_cas.swap_bytes())))),
            MACRO_VALUE_CRC32C => {
                // Filled in once the final body is known
                self.deferred_crc.push((key.to_string(), path.to_vec()));
                Ok(Some(Value::String(text)))
            }
            other if other.starts_with("${") && other.ends_with('}') => {
                Err(SubDocError::XattrUnknownMacro)
            }
            _ => Ok(None),
        }
    }

    fn virtual_attribute(&self, key: &str) -> Result<Value, SubDocError> {
        match key {
            "$document" => Ok(document_vattr(&self.original)),
            "$vbucket" => {
                let secs = self
                    .now
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                Ok(json!({"HLC": {"now": secs.to_string(), "mode": "real"}}))
            }
            "$XTOC" => Ok(Value::Array(
                self.xattrs.keys().cloned().map(Value::String).collect(),
            )),
            _ => Err(SubDocError::XattrUnknownVattr),
        }
    }

    fn body_bytes(&self) -> Vec<u8> {
        match &self.body {
            Body::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            Body::Raw(raw) => raw.clone(),
        }
    }

    /// Finish the batch, resolving deferred macros against the final body.
    pub fn finish(mut self) -> ExecutedDoc {
        let value = if self.body_dirty {
            self.body_bytes()
        } else {
            self.original.value.clone()
        };

        let crc = format!("0x{:08x}", crc32c::crc32c(&value));
        for (key, path) in std::mem::take(&mut self.deferred_crc) {
            let Some(raw) = self.xattrs.get(&key) else {
                continue;
            };
            let Ok(existing) = serde_json::from_slice::<Value>(raw) else {
                continue;
            };
            let mut root = keyed(&key, existing);
            if manip::replace(&mut root, &path, Value::String(crc.clone())).is_ok() {
                if let Some(Ok(encoded)) = root.get(&key).map(serde_json::to_vec) {
                    self.xattrs.insert(key, encoded);
                }
            }
        }

        ExecutedDoc {
            value,
            xattrs: self.xattrs,
            deleted: self.deleted,
        }
    }
}

/// A single-entry object, the shape xattr paths are resolved against.
fn keyed(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

fn document_vattr(doc: &Document) -> Value {
    let mut datatype = Vec::new();
    if doc.datatype & DATATYPE_JSON != 0 {
        datatype.push("json");
    }
    if doc.datatype & DATATYPE_SNAPPY != 0 {
        datatype.push("snappy");
    }
    if doc.datatype & DATATYPE_XATTR != 0 {
        datatype.push("xattr");
    }
    if datatype.is_empty() {
        datatype.push("raw");
    }
    let last_modified = doc
        .modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    json!({
        "CAS": format!("0x{:016x}", doc.cas),
        "vbucket_uuid": format!("0x{:016x}", doc.vb_uuid),
        "seqno": format!("0x{:016x}", doc.seq_no),
        "revid": doc.rev_id.to_string(),
        "exptime": doc.expiry_secs(),
        "value_bytes": doc.value.len(),
        "value_crc32c": format!("0x{:08x}", crc32c::crc32c(&doc.value)),
        "datatype": datatype,
        "deleted": doc.is_deleted,
        "flags": doc.flags,
        "last_modified": last_modified.to_string(),
    })
}

/// Apply one path operation to `root`. `override_value` replaces the
/// client-supplied value (used for expanded macros).
fn run_op(
    root: &mut Value,
    op: &SubDocOp,
    path: &[PathComponent],
    override_value: Option<Value>,
) -> SubDocResult {
    let single = |bytes: &[u8]| match &override_value {
        Some(value) => Ok(value.clone()),
        None => manip::parse_value(bytes),
    };
    let mkdir = op.mkdir_p();

    match op.opcode {
        OpCode::SUBDOC_GET | OpCode::SUBDOC_GET_DOC => {
            let value = manip::get(root, path)?;
            serde_json::to_vec(value).map_err(|_| SubDocError::NotJson)
        }
        OpCode::SUBDOC_EXISTS => manip::get(root, path).map(|_| Vec::new()),
        OpCode::SUBDOC_GET_COUNT => {
            manip::count(root, path).map(|count| count.to_string().into_bytes())
        }
        OpCode::SUBDOC_DICT_ADD => {
            manip::dict_add(root, path, single(&op.value)?, mkdir).map(|_| Vec::new())
        }
        OpCode::SUBDOC_DICT_UPSERT => {
            manip::dict_upsert(root, path, single(&op.value)?, mkdir).map(|_| Vec::new())
        }
        OpCode::SUBDOC_REPLACE => manip::replace(root, path, single(&op.value)?).map(|_| Vec::new()),
        OpCode::SUBDOC_DELETE => manip::delete(root, path).map(|_| Vec::new()),
        OpCode::SUBDOC_ARRAY_PUSH_LAST | OpCode::SUBDOC_ARRAY_PUSH_FIRST => {
            let values = match override_value {
                Some(value) => vec![value],
                None => manip::parse_values(&op.value)?,
            };
            let front = op.opcode == OpCode::SUBDOC_ARRAY_PUSH_FIRST;
            manip::array_push(root, path, values, front, mkdir).map(|_| Vec::new())
        }
        OpCode::SUBDOC_ARRAY_INSERT => {
            let values = match override_value {
                Some(value) => vec![value],
                None => manip::parse_values(&op.value)?,
            };
            manip::array_insert(root, path, values).map(|_| Vec::new())
        }
        OpCode::SUBDOC_ARRAY_ADD_UNIQUE => {
            manip::array_add_unique(root, path, single(&op.value)?, mkdir).map(|_| Vec::new())
        }
        OpCode::SUBDOC_COUNTER => {
            let delta = manip::parse_delta(&op.value)?;
            manip::counter(root, path, delta, mkdir).map(|value| value.to_string().into_bytes())
        }
        // Whole-document ops with a path, or anything else, are not valid here
        _ => Err(SubDocError::BadCombo),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memd::SUBDOC_FLAG_XATTR_PATH;

    fn doc_with(value: &str) -> Document {
        let mut doc = Document::new(0, 0, "key");
        doc.value = value.as_bytes().to_vec();
        doc.datatype = DATATYPE_JSON;
        doc.cas = 0x1122;
        doc
    }

    fn xattr(op: SubDocOp) -> SubDocOp {
        op.with_flags(SUBDOC_FLAG_XATTR_PATH)
    }

    #[test]
    fn lookups_report_individual_results() {
        let doc = doc_with(r#"{"a":{"b":[1,2,3]},"s":"x"}"#);
        let mut exec = Executor::new(&doc, SystemTime::now(), 1);
        let results = exec.run_all(&[
            SubDocOp::new(OpCode::SUBDOC_GET, "a.b[1]", ""),
            SubDocOp::new(OpCode::SUBDOC_EXISTS, "missing", ""),
            SubDocOp::new(OpCode::SUBDOC_GET_COUNT, "a.b", ""),
            SubDocOp::new(OpCode::SUBDOC_GET_DOC, "", ""),
        ]);
        assert_eq!(results[0], Ok(b"2".to_vec()));
        assert_eq!(results[1], Err(SubDocError::PathNotFound));
        assert_eq!(results[2], Ok(b"3".to_vec()));
        assert_eq!(results[3], Ok(doc.value.clone()));
    }

    #[test]
    fn body_ops_need_json() {
        let mut doc = doc_with("plain text");
        doc.datatype = 0;
        let mut exec = Executor::new(&doc, SystemTime::now(), 1);
        assert_eq!(
            exec.execute(&SubDocOp::new(OpCode::SUBDOC_GET, "a", "")),
            Err(SubDocError::NotJson)
        );
    }

    #[test]
    fn mutations_update_body_and_xattrs() {
        let doc = doc_with(r#"{"count":1}"#);
        let mut exec = Executor::new(&doc, SystemTime::now(), 1);
        let results = exec.run_all(&[
            xattr(SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "meta.owner", r#""me""#).with_flags(
                SUBDOC_FLAG_XATTR_PATH | SUBDOC_FLAG_MKDIR_P,
            )),
            SubDocOp::new(OpCode::SUBDOC_COUNTER, "count", "5"),
        ]);
        assert_eq!(results[1], Ok(b"6".to_vec()));

        let done = exec.finish();
        assert_eq!(done.value, br#"{"count":6}"#.to_vec());
        assert_eq!(done.xattrs.get("meta"), Some(&br#"{"owner":"me"}"#.to_vec()));
        assert!(!done.deleted);
    }

    #[test]
    fn virtual_attributes_are_read_only() {
        let doc = doc_with("{}");
        let mut exec = Executor::new(&doc, SystemTime::now(), 1);
        let cas = exec
            .execute(&xattr(SubDocOp::new(OpCode::SUBDOC_GET, "$document.CAS", "")))
            .unwrap();
        assert_eq!(cas, br#""0x0000000000001122""#.to_vec());
        assert!(exec.execute(&xattr(SubDocOp::new(OpCode::SUBDOC_GET, "$vbucket.HLC", ""))).is_ok());
        assert_eq!(
            exec.execute(&xattr(SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "$document.x", "1"))),
            Err(SubDocError::XattrCannotModifyVattr)
        );
        assert_eq!(
            exec.execute(&xattr(SubDocOp::new(OpCode::SUBDOC_GET, "$nope", ""))),
            Err(SubDocError::XattrUnknownVattr)
        );
    }

    #[test]
    fn macros_expand_into_xattrs() {
        let doc = doc_with(r#"{"a":1}"#);
        let mut exec = Executor::new(&doc, SystemTime::now(), 0x0102_0304_0506_0708);
        let flags = SUBDOC_FLAG_XATTR_PATH | SUBDOC_FLAG_MKDIR_P | SUBDOC_FLAG_EXPAND_MACROS;
        let results = exec.run_all(&[
            SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "txn.cas", r#""${Mutation.CAS}""#).with_flags(flags),
            SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "txn.crc", r#""${Mutation.value_crc32c}""#)
                .with_flags(flags),
            SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "txn.bad", r#""${Mutation.nope}""#).with_flags(flags),
        ]);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert_eq!(results[2], Err(SubDocError::XattrUnknownMacro));

        let done = exec.finish();
        let txn: Value = serde_json::from_slice(&done.xattrs["txn"]).unwrap();
        assert_eq!(txn["cas"], json!("0x0807060504030201"));
        let expected_crc = format!("0x{:08x}", crc32c::crc32c(br#"{"a":1}"#));
        assert_eq!(txn["crc"], json!(expected_crc));
    }

    #[test]
    fn delete_doc_keeps_system_xattrs() {
        let mut doc = doc_with("{}");
        doc.xattrs.insert("_sys".into(), b"1".to_vec());
        doc.xattrs.insert("user".into(), b"2".to_vec());
        let mut exec = Executor::new(&doc, SystemTime::now(), 1);
        exec.execute(&SubDocOp::new(OpCode::SUBDOC_DELETE_DOC, "", "")).unwrap();
        let done = exec.finish();
        assert!(done.deleted);
        assert!(done.value.is_empty());
        assert_eq!(done.xattrs.keys().collect::<Vec<_>>(), vec!["_sys"]);
    }

    #[test]
    fn batch_validation() {
        let body = SubDocOp::new(OpCode::SUBDOC_GET, "a", "");
        let xa = xattr(SubDocOp::new(OpCode::SUBDOC_GET, "x", ""));
        assert_eq!(validate_batch(&[xa.clone(), body.clone()], false), Ok(()));
        assert_eq!(
            validate_batch(&[body.clone(), xa], false),
            Err(SubDocError::InvalidXattrOrder)
        );
        assert_eq!(validate_batch(&[body.clone()], true), Err(SubDocError::BadCombo));
        assert_eq!(validate_batch(&vec![body; MAX_OPS + 1], false), Err(SubDocError::BadCombo));
        let macro_on_body = SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "a", "1")
            .with_flags(SUBDOC_FLAG_EXPAND_MACROS);
        assert_eq!(
            validate_batch(&[macro_on_body], true),
            Err(SubDocError::XattrInvalidFlagCombo)
        );
    }

    #[test]
    fn initial_body_shape() {
        assert_eq!(initial_body(&[SubDocOp::new(OpCode::SUBDOC_DICT_UPSERT, "a.b", "1")]), b"{}");
        assert_eq!(initial_body(&[SubDocOp::new(OpCode::SUBDOC_ARRAY_PUSH_LAST, "", "1")]), b"[]");
        assert_eq!(initial_body(&[SubDocOp::new(OpCode::SUBDOC_REPLACE, "[0]", "1")]), b"[]");
    }
}
