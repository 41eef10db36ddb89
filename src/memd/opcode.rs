//! Command opcodes, including subdoc operation codes.

use std::fmt;

/// A binary protocol command opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct OpCode(pub u8);

macro_rules! opcodes {
    ($($name:ident = $value:literal => $text:literal),* $(,)?) => {
        impl OpCode {
            $(pub const $name: OpCode = OpCode($value);)*

            /// Protocol name of the opcode, if known.
            pub fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($value => Some($text),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    GET = 0x00 => "GET",
    SET = 0x01 => "SET",
    ADD = 0x02 => "ADD",
    REPLACE = 0x03 => "REPLACE",
    DELETE = 0x04 => "DELETE",
    INCREMENT = 0x05 => "INCREMENT",
    DECREMENT = 0x06 => "DECREMENT",
    NOOP = 0x0a => "NOOP",
    APPEND = 0x0e => "APPEND",
    PREPEND = 0x0f => "PREPEND",
    STAT = 0x10 => "STAT",
    TOUCH = 0x1c => "TOUCH",
    GAT = 0x1d => "GAT",
    HELLO = 0x1f => "HELLO",
    SASL_LIST_MECHS = 0x20 => "SASL_LIST_MECHS",
    SASL_AUTH = 0x21 => "SASL_AUTH",
    SASL_STEP = 0x22 => "SASL_STEP",
    DCP_OPEN_CONNECTION = 0x50 => "DCP_OPEN_CONNECTION",
    DCP_ADD_STREAM = 0x51 => "DCP_ADD_STREAM",
    DCP_CLOSE_STREAM = 0x52 => "DCP_CLOSE_STREAM",
    DCP_STREAM_REQ = 0x53 => "DCP_STREAM_REQ",
    DCP_GET_FAILOVER_LOG = 0x54 => "DCP_GET_FAILOVER_LOG",
    DCP_STREAM_END = 0x55 => "DCP_STREAM_END",
    DCP_SNAPSHOT_MARKER = 0x56 => "DCP_SNAPSHOT_MARKER",
    DCP_MUTATION = 0x57 => "DCP_MUTATION",
    DCP_DELETION = 0x58 => "DCP_DELETION",
    DCP_EXPIRATION = 0x59 => "DCP_EXPIRATION",
    DCP_NOOP = 0x5c => "DCP_NOOP",
    DCP_BUFFER_ACK = 0x5d => "DCP_BUFFER_ACK",
    DCP_CONTROL = 0x5e => "DCP_CONTROL",
    GET_REPLICA = 0x83 => "GET_REPLICA",
    SELECT_BUCKET = 0x89 => "SELECT_BUCKET",
    OBSERVE_SEQNO = 0x91 => "OBSERVE_SEQNO",
    GET_LOCKED = 0x94 => "GET_LOCKED",
    UNLOCK = 0x95 => "UNLOCK",
    GET_META = 0xa0 => "GET_META",
    GET_CLUSTER_CONFIG = 0xb5 => "GET_CLUSTER_CONFIG",
    GET_RANDOM = 0xb6 => "GET_RANDOM",
    COLLECTIONS_GET_MANIFEST = 0xba => "COLLECTIONS_GET_MANIFEST",
    COLLECTIONS_GET_CID = 0xbb => "COLLECTIONS_GET_CID",
    SUBDOC_GET = 0xc5 => "SUBDOC_GET",
    SUBDOC_EXISTS = 0xc6 => "SUBDOC_EXISTS",
    SUBDOC_DICT_ADD = 0xc7 => "SUBDOC_DICT_ADD",
    SUBDOC_DICT_UPSERT = 0xc8 => "SUBDOC_DICT_UPSERT",
    SUBDOC_DELETE = 0xc9 => "SUBDOC_DELETE",
    SUBDOC_REPLACE = 0xca => "SUBDOC_REPLACE",
    SUBDOC_ARRAY_PUSH_LAST = 0xcb => "SUBDOC_ARRAY_PUSH_LAST",
    SUBDOC_ARRAY_PUSH_FIRST = 0xcc => "SUBDOC_ARRAY_PUSH_FIRST",
    SUBDOC_ARRAY_INSERT = 0xcd => "SUBDOC_ARRAY_INSERT",
    SUBDOC_ARRAY_ADD_UNIQUE = 0xce => "SUBDOC_ARRAY_ADD_UNIQUE",
    SUBDOC_COUNTER = 0xcf => "SUBDOC_COUNTER",
    SUBDOC_MULTI_LOOKUP = 0xd0 => "SUBDOC_MULTI_LOOKUP",
    SUBDOC_MULTI_MUTATION = 0xd1 => "SUBDOC_MULTI_MUTATION",
    SUBDOC_GET_COUNT = 0xd2 => "SUBDOC_GET_COUNT",
    GET_ERROR_MAP = 0xfe => "GET_ERROR_MAP",
}

impl OpCode {
    /// Whole-document get inside a multi lookup (shares the GET opcode).
    pub const SUBDOC_GET_DOC: OpCode = OpCode::GET;
    /// Whole-document set inside a multi mutation (shares the SET opcode).
    pub const SUBDOC_SET_DOC: OpCode = OpCode::SET;
    /// Whole-document delete inside a multi mutation (shares the DELETE opcode).
    pub const SUBDOC_DELETE_DOC: OpCode = OpCode::DELETE;

    /// Whether keys of this command carry a LEB128 collection id prefix
    /// once collections are negotiated.
    pub fn supports_collection_id(self) -> bool {
        matches!(
            self,
            OpCode::GET
                | OpCode::SET
                | OpCode::ADD
                | OpCode::REPLACE
                | OpCode::DELETE
                | OpCode::INCREMENT
                | OpCode::DECREMENT
                | OpCode::APPEND
                | OpCode::PREPEND
                | OpCode::TOUCH
                | OpCode::GAT
                | OpCode::GET_REPLICA
                | OpCode::GET_LOCKED
                | OpCode::UNLOCK
                | OpCode::GET_META
                | OpCode::SUBDOC_GET
                | OpCode::SUBDOC_EXISTS
                | OpCode::SUBDOC_DICT_ADD
                | OpCode::SUBDOC_DICT_UPSERT
                | OpCode::SUBDOC_DELETE
                | OpCode::SUBDOC_REPLACE
                | OpCode::SUBDOC_ARRAY_PUSH_LAST
                | OpCode::SUBDOC_ARRAY_PUSH_FIRST
                | OpCode::SUBDOC_ARRAY_INSERT
                | OpCode::SUBDOC_ARRAY_ADD_UNIQUE
                | OpCode::SUBDOC_COUNTER
                | OpCode::SUBDOC_MULTI_LOOKUP
                | OpCode::SUBDOC_MULTI_MUTATION
                | OpCode::SUBDOC_GET_COUNT
        )
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "UNKNOWN(0x{:02x})", self.0),
        }
    }
}
