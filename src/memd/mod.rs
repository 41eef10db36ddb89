//! The memcached-derived binary KV protocol.
//!
//! This module is protocol-only: packet framing, opcode/status/feature
//! tables and the error map. Command semantics live in `handlers`.

pub mod buffer;
mod errmap;
mod feature;
mod opcode;
mod packet;
mod status;

pub use errmap::{ErrorMap, ErrorMapEntry, MAX_ERRMAP_VERSION};
pub use feature::{HelloFeature, SERVER_FEATURES, negotiate};
pub use opcode::OpCode;
pub use packet::{
    HEADER_LEN, MAX_BODY_LEN, Magic, Packet, PacketError, decode_server_duration,
    encode_server_duration, read_packet,
};
pub use status::{STATUSES, Status, StatusInfo};

/// Subdoc path flag: create intermediate path components.
pub const SUBDOC_FLAG_MKDIR_P: u8 = 0x01;
/// Subdoc path flag: the path addresses an extended attribute.
pub const SUBDOC_FLAG_XATTR_PATH: u8 = 0x04;
/// Subdoc path flag: expand `${Mutation.*}` macros in the value.
pub const SUBDOC_FLAG_EXPAND_MACROS: u8 = 0x10;

/// Subdoc document flag: create the document if missing.
pub const SUBDOC_DOC_FLAG_MKDOC: u8 = 0x01;
/// Subdoc document flag: create the document, failing if it exists.
pub const SUBDOC_DOC_FLAG_ADD: u8 = 0x02;
/// Subdoc document flag: operate on tombstones.
pub const SUBDOC_DOC_FLAG_ACCESS_DELETED: u8 = 0x04;
/// Subdoc document flag: create the document as a tombstone.
pub const SUBDOC_DOC_FLAG_CREATE_AS_DELETED: u8 = 0x08;
