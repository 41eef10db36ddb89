//! Per-node entries of config documents.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cluster::{Bucket, ClusterNode};
use crate::services::ServiceType;

/// Port reported for services the mock does not run.
const UNSUPPORTED_PORT: u16 = 32767;

const NODE_VERSION: &str = "7.0.0-3016-enterprise";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalListener {
    pub afamily: &'static str,
    pub node_encryption: bool,
}

/// A node as listed in `/pools/default` and full bucket configs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub couch_api_base: Option<String>,
    #[serde(rename = "couchApiBaseHTTPS", skip_serializing_if = "Option::is_none")]
    pub couch_api_base_https: Option<String>,
    pub otp_node: String,
    pub this_node: bool,
    pub hostname: String,
    pub configured_hostname: String,
    #[serde(rename = "nodeUUID")]
    pub node_uuid: String,
    pub recovery_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<u32>,
    pub ports: BTreeMap<&'static str, u16>,
    pub services: Vec<&'static str>,
    pub node_encryption: bool,
    pub address_family: &'static str,
    pub external_listeners: Vec<ExternalListener>,
    pub cluster_compatibility: u32,
    pub version: &'static str,
    pub os: &'static str,
    pub cluster_membership: &'static str,
    pub status: &'static str,
}

/// A node as listed in terse bucket configs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerseNodeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub couch_api_base: Option<String>,
    pub hostname: String,
    pub ports: BTreeMap<&'static str, u16>,
}

/// A node's service port map, as listed under `nodesExt`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtNodeConfig {
    pub services: BTreeMap<&'static str, u16>,
    pub this_node: bool,
}

fn mgmt_hostname(node: &ClusterNode) -> String {
    format!("{}:{}", node.hostname(), node.port(ServiceType::Mgmt))
}

/// View endpoint, scoped to a bucket when one is given. The `%2B` is a
/// URL-encoded `+` joining the bucket name and uuid.
fn couch_api_base(node: &ClusterNode, port: u16, bucket: Option<&Bucket>) -> Option<String> {
    if node.views_service().is_none() || port == 0 {
        return None;
    }
    Some(match bucket {
        Some(bucket) => format!("http://{}:{}/{}%2B{}", node.hostname(), port, bucket.name(), bucket.id()),
        None => format!("http://{}:{}/", node.hostname(), port),
    })
}

pub fn node_config(node: &ClusterNode, req_node: &ClusterNode, bucket: Option<&Bucket>) -> NodeConfig {
    let mut ports = BTreeMap::from([("distTCP", UNSUPPORTED_PORT), ("distTLS", UNSUPPORTED_PORT)]);
    let mut services = vec!["index"];
    if node.kv_service().is_some() {
        services.push("kv");
        ports.insert("direct", node.port(ServiceType::KeyValue));
    }
    if node.mgmt_service().is_some() {
        ports.insert("httpsMgmt", node.tls_port(ServiceType::Mgmt));
    }
    if node.views_service().is_some() {
        ports.insert("httpsCAPI", node.tls_port(ServiceType::Views));
    }
    if node.query_service().is_some() {
        services.push("n1ql");
    }
    if node.analytics_service().is_some() {
        services.push("cbas");
    }
    if node.search_service().is_some() {
        services.push("fts");
    }

    NodeConfig {
        couch_api_base: couch_api_base(node, node.port(ServiceType::Views), bucket),
        couch_api_base_https: couch_api_base(node, node.tls_port(ServiceType::Views), bucket),
        otp_node: format!("ns_1@{}", node.hostname()),
        this_node: node.id() == req_node.id(),
        hostname: mgmt_hostname(node),
        configured_hostname: mgmt_hostname(node),
        node_uuid: node.id().to_string(),
        recovery_type: "none",
        replication: bucket.map(|_| 0),
        ports,
        services,
        node_encryption: false,
        address_family: "inet",
        external_listeners: vec![
            ExternalListener {
                afamily: "inet",
                node_encryption: false,
            },
            ExternalListener {
                afamily: "inet6",
                node_encryption: false,
            },
        ],
        cluster_compatibility: 458752,
        version: NODE_VERSION,
        os: "x86_64-unknown-linux-gnu",
        cluster_membership: "active",
        status: "healthy",
    }
}

pub fn terse_node_config(node: &ClusterNode, bucket: Option<&Bucket>) -> TerseNodeConfig {
    let mut ports = BTreeMap::new();
    if node.kv_service().is_some() {
        ports.insert("direct", node.port(ServiceType::KeyValue));
    }
    TerseNodeConfig {
        couch_api_base: couch_api_base(node, node.port(ServiceType::Views), bucket),
        hostname: mgmt_hostname(node),
        ports,
    }
}

pub fn ext_node_config(node: &ClusterNode, req_node: &ClusterNode) -> ExtNodeConfig {
    let mut services: BTreeMap<&'static str, u16> = [
        "indexAdmin",
        "indexScan",
        "indexHttp",
        "indexHttps",
        "indexStreamInit",
        "indexStreamCatchup",
        "indexStreamMaint",
        "projector",
    ]
    .into_iter()
    .map(|name| (name, UNSUPPORTED_PORT))
    .collect();

    let named = [
        (ServiceType::KeyValue, "kv", "kvSSL"),
        (ServiceType::Mgmt, "mgmt", "mgmtSSL"),
        (ServiceType::Views, "capi", "capiSSL"),
        (ServiceType::Query, "n1ql", "n1qlSSL"),
        (ServiceType::Analytics, "cbas", "cbasSSL"),
        (ServiceType::Search, "fts", "ftsSSL"),
    ];
    for (service, plain, tls) in named {
        let port = node.port(service);
        if port > 0 {
            services.insert(plain, port);
        }
        let tls_port = node.tls_port(service);
        if tls_port > 0 {
            services.insert(tls, tls_port);
        }
    }

    ExtNodeConfig {
        services,
        this_node: node.id() == req_node.id(),
    }
}
