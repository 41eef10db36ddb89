//! Response status codes.

use std::fmt;

/// A binary protocol response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Status(pub u16);

/// Static description of a status, used for display and the error map.
#[derive(Debug, Clone, Copy)]
pub struct StatusInfo {
    pub status: Status,
    pub name: &'static str,
    pub desc: &'static str,
    pub attrs: &'static [&'static str],
}

macro_rules! statuses {
    ($($name:ident = $value:literal => ($text:literal, $desc:literal, [$($attr:literal),*])),* $(,)?) => {
        impl Status {
            $(pub const $name: Status = Status($value);)*
        }

        /// Every known status.
        pub const STATUSES: &[StatusInfo] = &[
            $(StatusInfo {
                status: Status($value),
                name: $text,
                desc: $desc,
                attrs: &[$($attr),*],
            },)*
        ];
    };
}

statuses! {
    SUCCESS = 0x00 => ("SUCCESS", "Success", ["success"]),
    KEY_NOT_FOUND = 0x01 => ("KEY_ENOENT", "Not Found", ["item-only"]),
    KEY_EXISTS = 0x02 => ("KEY_EEXISTS", "key already exists, or CAS mismatch", ["item-only"]),
    TOO_BIG = 0x03 => ("E2BIG", "Value is too big", ["item-only", "invalid-input"]),
    INVALID_ARGS = 0x04 => ("EINVAL", "Invalid packet", ["internal", "invalid-input"]),
    NOT_STORED = 0x05 => ("NOT_STORED", "Not Stored", ["item-only"]),
    BAD_DELTA = 0x06 => ("DELTA_BADVAL", "Existing document not a number", ["item-only", "invalid-input"]),
    NOT_MY_VBUCKET = 0x07 => ("NOT_MY_VBUCKET", "Server which received the request is not responsible for the vBucket", ["fetch-config", "invalid-input"]),
    NO_BUCKET = 0x08 => ("NO_BUCKET", "Not connected to a bucket", ["conn-state-invalidated", "fetch-config"]),
    LOCKED = 0x09 => ("LOCKED", "Requested resource is locked", ["item-locked", "item-only", "retry-now"]),
    AUTH_ERROR = 0x20 => ("AUTH_ERROR", "Authentication failed", ["auth", "conn-state-invalidated"]),
    AUTH_CONTINUE = 0x21 => ("AUTH_CONTINUE", "Continue authentication", ["auth", "special-handling"]),
    RANGE_ERROR = 0x22 => ("ERANGE", "Range error", ["invalid-input"]),
    ROLLBACK = 0x23 => ("ROLLBACK", "Rollback required", ["special-handling"]),
    ACCESS_ERROR = 0x24 => ("EACCESS", "No access", ["auth", "support"]),
    NOT_INITIALIZED = 0x25 => ("NOT_INITIALIZED", "The server is not initialized", ["conn-state-invalidated", "retry-later"]),
    UNKNOWN_COMMAND = 0x81 => ("UNKNOWN_COMMAND", "Unknown command", ["support"]),
    OUT_OF_MEMORY = 0x82 => ("ENOMEM", "Out of memory", ["temp", "retry-later"]),
    NOT_SUPPORTED = 0x83 => ("NOT_SUPPORTED", "Not supported", ["support"]),
    INTERNAL_ERROR = 0x84 => ("EINTERNAL", "Internal error", ["internal"]),
    BUSY = 0x85 => ("EBUSY", "Server is busy", ["temp", "retry-later"]),
    TMP_FAIL = 0x86 => ("ETMPFAIL", "Temporary failure", ["temp", "retry-now"]),
    UNKNOWN_COLLECTION = 0x88 => ("UNKNOWN_COLLECTION", "Unknown collection", ["fetch-config", "item-only"]),
    UNKNOWN_SCOPE = 0x8c => ("UNKNOWN_SCOPE", "Unknown scope", ["fetch-config", "item-only"]),
    SUBDOC_PATH_NOT_FOUND = 0xc0 => ("SUBDOC_PATH_ENOENT", "Subdoc: path not found", ["subdoc", "item-only"]),
    SUBDOC_PATH_MISMATCH = 0xc1 => ("SUBDOC_PATH_MISMATCH", "Subdoc: path mismatch", ["subdoc", "item-only"]),
    SUBDOC_PATH_INVALID = 0xc2 => ("SUBDOC_PATH_EINVAL", "Subdoc: invalid path", ["subdoc", "invalid-input"]),
    SUBDOC_PATH_TOO_BIG = 0xc3 => ("SUBDOC_PATH_E2BIG", "Subdoc: path too large", ["subdoc", "invalid-input"]),
    SUBDOC_DOC_TOO_DEEP = 0xc4 => ("SUBDOC_DOC_E2DEEP", "Subdoc: document too deep", ["subdoc", "item-only"]),
    SUBDOC_CANT_INSERT = 0xc5 => ("SUBDOC_VALUE_CANTINSERT", "Subdoc: cannot insert value", ["subdoc", "invalid-input"]),
    SUBDOC_NOT_JSON = 0xc6 => ("SUBDOC_DOC_NOTJSON", "Subdoc: document is not JSON", ["subdoc", "item-only"]),
    SUBDOC_BAD_RANGE = 0xc7 => ("SUBDOC_NUM_ERANGE", "Subdoc: number out of range", ["subdoc", "item-only"]),
    SUBDOC_BAD_DELTA = 0xc8 => ("SUBDOC_DELTA_EINVAL", "Subdoc: invalid delta", ["subdoc", "invalid-input"]),
    SUBDOC_PATH_EXISTS = 0xc9 => ("SUBDOC_PATH_EEXISTS", "Subdoc: path already exists", ["subdoc", "item-only"]),
    SUBDOC_VALUE_TOO_DEEP = 0xca => ("SUBDOC_VALUE_ETOODEEP", "Subdoc: value too deep", ["subdoc", "invalid-input"]),
    SUBDOC_BAD_COMBO = 0xcb => ("SUBDOC_INVALID_COMBO", "Subdoc: invalid combination of commands", ["subdoc", "invalid-input"]),
    SUBDOC_BAD_MULTI = 0xcc => ("SUBDOC_MULTI_PATH_FAILURE", "Subdoc: one or more paths failed", ["subdoc"]),
    SUBDOC_SUCCESS_DELETED = 0xcd => ("SUBDOC_SUCCESS_DELETED", "Subdoc: success on a deleted document", ["subdoc", "success"]),
    SUBDOC_XATTR_INVALID_FLAG_COMBO = 0xce => ("SUBDOC_XATTR_INVALID_FLAG_COMBO", "Subdoc: invalid xattr flag combination", ["subdoc", "invalid-input"]),
    SUBDOC_XATTR_INVALID_KEY_COMBO = 0xcf => ("SUBDOC_XATTR_INVALID_KEY_COMBO", "Subdoc: invalid xattr key combination", ["subdoc", "invalid-input"]),
    SUBDOC_XATTR_UNKNOWN_MACRO = 0xd0 => ("SUBDOC_XATTR_UNKNOWN_MACRO", "Subdoc: unknown xattr macro", ["subdoc", "invalid-input"]),
    SUBDOC_XATTR_UNKNOWN_VATTR = 0xd1 => ("SUBDOC_XATTR_UNKNOWN_VATTR", "Subdoc: unknown virtual attribute", ["subdoc", "invalid-input"]),
    SUBDOC_XATTR_CANT_MODIFY_VATTR = 0xd2 => ("SUBDOC_XATTR_CANT_MODIFY_VATTR", "Subdoc: cannot modify virtual attribute", ["subdoc", "invalid-input"]),
    SUBDOC_MULTI_PATH_FAILURE_DELETED = 0xd3 => ("SUBDOC_MULTI_PATH_FAILURE_DELETED", "Subdoc: one or more paths failed on a deleted document", ["subdoc"]),
    SUBDOC_INVALID_XATTR_ORDER = 0xd4 => ("SUBDOC_INVALID_XATTR_ORDER", "Subdoc: xattr paths must come first", ["subdoc", "invalid-input"]),
}

impl Status {
    pub fn info(self) -> Option<&'static StatusInfo> {
        STATUSES.iter().find(|info| info.status == self)
    }

    pub fn name(self) -> Option<&'static str> {
        self.info().map(|info| info.name)
    }

    pub fn is_success(self) -> bool {
        self == Status::SUCCESS || self == Status::SUBDOC_SUCCESS_DELETED
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "UNKNOWN_STATUS(0x{:04x})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_value() {
        assert_eq!(Status(0x86), Status::TMP_FAIL);
        assert_eq!(Status::TMP_FAIL.name(), Some("ETMPFAIL"));
        assert_eq!(Status(0x4242).to_string(), "UNKNOWN_STATUS(0x4242)");
    }

    #[test]
    fn statuses_are_unique() {
        for (i, a) in STATUSES.iter().enumerate() {
            for b in STATUSES.iter().skip(i + 1) {
                assert_ne!(a.status, b.status, "{} and {}", a.name, b.name);
            }
        }
    }
}
