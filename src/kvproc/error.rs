//! Error types for the KV operation engine.

use thiserror::Error;

use crate::memd::Status;
use crate::store::StoreError;

/// Per-path failures of subdocument operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubDocError {
    #[error("Path not found")]
    PathNotFound,
    #[error("Path mismatch")]
    PathMismatch,
    #[error("Invalid path")]
    PathInvalid,
    #[error("Path too big")]
    PathTooBig,
    #[error("Document too deep")]
    DocTooDeep,
    #[error("Cannot insert value")]
    CantInsert,
    #[error("Document is not JSON")]
    NotJson,
    #[error("Number out of range")]
    NumRange,
    #[error("Invalid delta")]
    BadDelta,
    #[error("Path already exists")]
    PathExists,
    #[error("Value too deep")]
    ValueTooDeep,
    #[error("Invalid combination of operations")]
    BadCombo,
    #[error("Invalid xattr flag combination")]
    XattrInvalidFlagCombo,
    #[error("Invalid xattr key combination")]
    XattrInvalidKeyCombo,
    #[error("Unknown xattr macro")]
    XattrUnknownMacro,
    #[error("Unknown virtual attribute")]
    XattrUnknownVattr,
    #[error("Cannot modify virtual attribute")]
    XattrCannotModifyVattr,
    #[error("Xattr operations must come before body operations")]
    InvalidXattrOrder,
}

impl SubDocError {
    pub fn status(self) -> Status {
        match self {
            SubDocError::PathNotFound => Status::SUBDOC_PATH_NOT_FOUND,
            SubDocError::PathMismatch => Status::SUBDOC_PATH_MISMATCH,
            SubDocError::PathInvalid => Status::SUBDOC_PATH_INVALID,
            SubDocError::PathTooBig => Status::SUBDOC_PATH_TOO_BIG,
            SubDocError::DocTooDeep => Status::SUBDOC_DOC_TOO_DEEP,
            SubDocError::CantInsert => Status::SUBDOC_CANT_INSERT,
            SubDocError::NotJson => Status::SUBDOC_NOT_JSON,
            SubDocError::NumRange => Status::SUBDOC_BAD_RANGE,
            SubDocError::BadDelta => Status::SUBDOC_BAD_DELTA,
            SubDocError::PathExists => Status::SUBDOC_PATH_EXISTS,
            SubDocError::ValueTooDeep => Status::SUBDOC_VALUE_TOO_DEEP,
            SubDocError::BadCombo => Status::SUBDOC_BAD_COMBO,
            SubDocError::XattrInvalidFlagCombo => Status::SUBDOC_XATTR_INVALID_FLAG_COMBO,
            SubDocError::XattrInvalidKeyCombo => Status::SUBDOC_XATTR_INVALID_KEY_COMBO,
            SubDocError::XattrUnknownMacro => Status::SUBDOC_XATTR_UNKNOWN_MACRO,
            SubDocError::XattrUnknownVattr => Status::SUBDOC_XATTR_UNKNOWN_VATTR,
            SubDocError::XattrCannotModifyVattr => Status::SUBDOC_XATTR_CANT_MODIFY_VATTR,
            SubDocError::InvalidXattrOrder => Status::SUBDOC_INVALID_XATTR_ORDER,
        }
    }
}

/// Failures of KV operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcError {
    #[error("Not supported")]
    NotSupported,

    #[error("Not my vbucket")]
    NotMyVbucket,

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

    #[error("Value too big")]
    TooBig,

    #[error("Invalid arguments: {0}")]
    InvalidArgs(&'static str),

    #[error("Existing value is not a number")]
    BadDelta,

    #[error("Too many retries")]
    TooManyTries,

    #[error("Unknown collection")]
    UnknownCollection,

    #[error("Unknown scope")]
    UnknownScope,

    #[error("Subdoc: {0}")]
    SubDoc(#[from] SubDocError),

    #[error("Subdoc operation {index} failed: {error}")]
    MultiFailure { index: u8, error: SubDocError },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProcError {
    /// Status returned to the client for this failure.
    pub fn status(&self) -> Status {
        match self {
            ProcError::NotSupported => Status::NOT_SUPPORTED,
            ProcError::NotMyVbucket => Status::NOT_MY_VBUCKET,
            ProcError::NotFound => Status::KEY_NOT_FOUND,
            ProcError::Exists | ProcError::CasMismatch => Status::KEY_EXISTS,
            ProcError::Locked => Status::LOCKED,
            ProcError::NotLocked | ProcError::TooManyTries => Status::TMP_FAIL,
            ProcError::TooBig => Status::TOO_BIG,
            ProcError::InvalidArgs(_) => Status::INVALID_ARGS,
            ProcError::BadDelta => Status::BAD_DELTA,
            ProcError::UnknownCollection => Status::UNKNOWN_COLLECTION,
            ProcError::UnknownScope => Status::UNKNOWN_SCOPE,
            ProcError::SubDoc(err) => err.status(),
            ProcError::MultiFailure { .. } => Status::SUBDOC_BAD_MULTI,
            ProcError::Internal(_) => Status::INTERNAL_ERROR,
        }
    }
}

impl From<StoreError> for ProcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ProcError::NotFound,
            StoreError::Exists => ProcError::Exists,
            StoreError::CasMismatch => ProcError::CasMismatch,
            StoreError::Locked => ProcError::Locked,
            StoreError::NotLocked => ProcError::NotLocked,
            StoreError::ValueTooBig { .. } => ProcError::TooBig,
            StoreError::InvalidVbucket(_) => ProcError::NotMyVbucket,
            other => ProcError::Internal(other.to_string()),
        }
    }
}
