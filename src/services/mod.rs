//! Network listeners a cluster node exposes.
//!
//! Each node runs one binary KV listener and a set of HTTP listeners
//! (management, views, query, search, analytics). Listeners only frame
//! requests; all behaviour lives in the cluster's hook chains.

pub mod http;
pub mod kv;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ClusterNode;

pub use http::{HttpBody, HttpRequest, HttpResponse, HttpService};
pub use kv::{KvClient, KvService};

/// Kinds of service a node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[serde(alias = "kv")]
    KeyValue,
    Mgmt,
    Views,
    Query,
    Search,
    Analytics,
}

impl ServiceType {
    pub const ALL: &'static [ServiceType] = &[
        ServiceType::KeyValue,
        ServiceType::Mgmt,
        ServiceType::Views,
        ServiceType::Query,
        ServiceType::Search,
        ServiceType::Analytics,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Mgmt => "mgmt",
            ServiceType::Views => "views",
            ServiceType::Query => "query",
            ServiceType::Search => "search",
            ServiceType::Analytics => "analytics",
        }
    }

    /// Whether `list` enables this service. An empty list enables everything.
    pub fn enabled_in(self, list: &[ServiceType]) -> bool {
        list.is_empty() || list.contains(&self)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capabilities shared by every listener.
pub trait Service: Send + Sync {
    fn service_type(&self) -> ServiceType;

    /// The node running this service, if it is still alive.
    fn node(&self) -> Option<Arc<ClusterNode>>;

    fn hostname(&self) -> &str;

    fn listen_port(&self) -> u16;

    /// TLS port. TLS listeners are not started, so this is always 0.
    fn listen_port_tls(&self) -> u16 {
        0
    }

    /// Stop listening and drop every connection.
    fn close(&self);
}

/// Errors starting or using a listener.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Failed to bind {service} listener: {source}")]
    Bind {
        service: ServiceType,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed")]
    Closed,

    #[error("Packet error: {0}")]
    Packet(#[from] crate::memd::PacketError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_service_list_enables_all() {
        assert!(ServiceType::Query.enabled_in(&[]));
        assert!(ServiceType::KeyValue.enabled_in(&[ServiceType::KeyValue]));
        assert!(!ServiceType::Mgmt.enabled_in(&[ServiceType::KeyValue]));
    }

    #[test]
    fn service_names_deserialize() {
        let parsed: Vec<ServiceType> = serde_json::from_str(r#"["kv","keyvalue","mgmt","analytics"]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                ServiceType::KeyValue,
                ServiceType::KeyValue,
                ServiceType::Mgmt,
                ServiceType::Analytics
            ]
        );
    }
}
