//! HELLO feature codes.

use std::fmt;

/// A feature negotiated through HELLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HelloFeature(pub u16);

impl HelloFeature {
    pub const DATATYPE: HelloFeature = HelloFeature(0x01);
    pub const TLS: HelloFeature = HelloFeature(0x02);
    pub const TCP_NO_DELAY: HelloFeature = HelloFeature(0x03);
    pub const SEQ_NO: HelloFeature = HelloFeature(0x04);
    pub const TCP_DELAY: HelloFeature = HelloFeature(0x05);
    pub const XATTR: HelloFeature = HelloFeature(0x06);
    pub const XERROR: HelloFeature = HelloFeature(0x07);
    pub const SELECT_BUCKET: HelloFeature = HelloFeature(0x08);
    pub const SNAPPY: HelloFeature = HelloFeature(0x0a);
    pub const JSON: HelloFeature = HelloFeature(0x0b);
    pub const DUPLEX: HelloFeature = HelloFeature(0x0c);
    pub const CLUSTER_MAP_NOTIF: HelloFeature = HelloFeature(0x0d);
    pub const UNORDERED_EXEC: HelloFeature = HelloFeature(0x0e);
    pub const DURATIONS: HelloFeature = HelloFeature(0x0f);
    pub const ALT_REQUESTS: HelloFeature = HelloFeature(0x10);
    pub const SYNC_REPLICATION: HelloFeature = HelloFeature(0x11);
    pub const COLLECTIONS: HelloFeature = HelloFeature(0x12);
    pub const OPEN_TRACING: HelloFeature = HelloFeature(0x13);
    pub const PRESERVE_TTL: HelloFeature = HelloFeature(0x14);
    pub const CREATE_AS_DELETED: HelloFeature = HelloFeature(0x17);

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            HelloFeature::DATATYPE => "Datatype",
            HelloFeature::TLS => "TLS",
            HelloFeature::TCP_NO_DELAY => "TCPNoDelay",
            HelloFeature::SEQ_NO => "SeqNo",
            HelloFeature::TCP_DELAY => "TCPDelay",
            HelloFeature::XATTR => "Xattr",
            HelloFeature::XERROR => "XError",
            HelloFeature::SELECT_BUCKET => "SelectBucket",
            HelloFeature::SNAPPY => "Snappy",
            HelloFeature::JSON => "JSON",
            HelloFeature::DUPLEX => "Duplex",
            HelloFeature::CLUSTER_MAP_NOTIF => "ClusterMapNotif",
            HelloFeature::UNORDERED_EXEC => "UnorderedExec",
            HelloFeature::DURATIONS => "Durations",
            HelloFeature::ALT_REQUESTS => "AltRequests",
            HelloFeature::SYNC_REPLICATION => "SyncReplication",
            HelloFeature::COLLECTIONS => "Collections",
            HelloFeature::OPEN_TRACING => "OpenTracing",
            HelloFeature::PRESERVE_TTL => "PreserveTTL",
            HelloFeature::CREATE_AS_DELETED => "CreateAsDeleted",
            _ => return None,
        })
    }
}

/// Features the server is willing to enable. Snappy is left out because
/// values are never decompressed.
pub const SERVER_FEATURES: &[HelloFeature] = &[
    HelloFeature::DATATYPE,
    HelloFeature::SEQ_NO,
    HelloFeature::XATTR,
    HelloFeature::XERROR,
    HelloFeature::SELECT_BUCKET,
    HelloFeature::JSON,
    HelloFeature::DUPLEX,
    HelloFeature::UNORDERED_EXEC,
    HelloFeature::DURATIONS,
    HelloFeature::ALT_REQUESTS,
    HelloFeature::COLLECTIONS,
    HelloFeature::CREATE_AS_DELETED,
];

/// Features to enable for a client request: the requested ones the server
/// supports, without duplicates, in request order.
pub fn negotiate(requested: &[HelloFeature]) -> Vec<HelloFeature> {
    let mut enabled: Vec<HelloFeature> = Vec::with_capacity(requested.len());
    for feature in requested {
        if SERVER_FEATURES.contains(feature) && !enabled.contains(feature) {
            enabled.push(*feature);
        }
    }
    enabled
}

impl fmt::Display for HelloFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "Unknown(0x{:02x})", self.0),
        }
    }
}
