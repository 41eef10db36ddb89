//! Bucket config documents.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::node::{ExtNodeConfig, NodeConfig, TerseNodeConfig, ext_node_config, node_config, terse_node_config};
use super::{ClusterCapabilities, CLUSTER_CAPABILITIES_VER};
use crate::cluster::{Bucket, BucketType, Cluster, ClusterNode};
use crate::services::ServiceType;

const BUCKET_CAPABILITIES: &[&str] = &[
    "collections",
    "durableWrite",
    "tombstonedUserXAttrs",
    "couchapi",
    "dcp",
    "cbhello",
    "touch",
    "cccp",
    "xdcrCheckpointing",
    "nodesExt",
    "xattr",
];

/// Nodes and vbucket map of a bucket, with map entries as indexes into `kv_nodes`.
#[derive(Debug, Clone)]
pub struct VbServerInfo {
    /// Nodes in order of first appearance in the vbucket map.
    pub kv_nodes: Vec<Arc<ClusterNode>>,
    /// Node index per vbucket and replica, `-1` for unassigned.
    pub vb_map: Vec<Vec<i32>>,
    /// `kv_nodes` followed by every other node of the cluster.
    pub all_nodes: Vec<Arc<ClusterNode>>,
}

/// Index of node `id` in `listed`, appending it from `nodes` on first sight.
fn node_index(nodes: &[Arc<ClusterNode>], listed: &mut Vec<Arc<ClusterNode>>, id: &str) -> i32 {
    if let Some(pos) = listed.iter().position(|n| n.id() == id) {
        return i32::try_from(pos).unwrap_or(-1);
    }
    match nodes.iter().find(|n| n.id() == id) {
        Some(node) => {
            listed.push(Arc::clone(node));
            i32::try_from(listed.len() - 1).unwrap_or(-1)
        }
        None => -1,
    }
}

pub fn vb_server_info(cluster: &Cluster, bucket: &Bucket) -> VbServerInfo {
    let nodes = cluster.nodes();
    let mut listed = Vec::new();

    let mut vb_map = Vec::new();
    for replicas in bucket.vb_map() {
        let row = replicas
            .iter()
            .map(|owner| match owner {
                Some(id) => node_index(&nodes, &mut listed, id),
                None => -1,
            })
            .collect();
        vb_map.push(row);
    }

    let kv_nodes = listed.clone();
    for node in &nodes {
        node_index(&nodes, &mut listed, node.id());
    }

    VbServerInfo {
        kv_nodes,
        vb_map,
        all_nodes: listed,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VbucketServerMap {
    pub hash_algorithm: &'static str,
    pub num_replicas: u32,
    pub server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UriRef {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub ram: u64,
    #[serde(rename = "rawRAM")]
    pub raw_ram: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStatsUris {
    pub uri: String,
    #[serde(rename = "directoryURI")]
    pub directory_uri: String,
    #[serde(rename = "nodeStatsListURI")]
    pub node_stats_list_uri: String,
}

/// The terse bucket config served over CCCP and `/pools/default/b/<name>`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerseBucketConfig {
    pub rev: u64,
    pub name: String,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections_manifest_uid: Option<String>,
    pub uri: String,
    pub streaming_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddocs: Option<UriRef>,
    pub cluster_capabilities_ver: [u32; 2],
    pub cluster_capabilities: ClusterCapabilities,
    pub bucket_capabilities_ver: &'static str,
    pub bucket_capabilities: &'static [&'static str],
    pub nodes: Vec<TerseNodeConfig>,
    pub nodes_ext: Vec<ExtNodeConfig>,
    pub node_locator: &'static str,
    #[serde(rename = "vBucketServerMap", skip_serializing_if = "Option::is_none")]
    pub vbucket_server_map: Option<VbucketServerMap>,
}

/// The full bucket config served by `/pools/default/buckets/<name>`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    pub rev: u64,
    pub name: String,
    pub uuid: String,
    pub bucket_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections_manifest_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durability_min_level: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddocs: Option<UriRef>,
    pub eviction_policy: &'static str,
    pub storage_backend: &'static str,
    pub compression_mode: String,
    pub replica_index: bool,
    pub replica_number: u32,
    pub threads_number: u32,
    pub auth_type: &'static str,
    pub conflict_resolution_type: &'static str,
    #[serde(rename = "maxTTL")]
    pub max_ttl: u32,
    pub local_random_key_uri: String,
    pub uri: String,
    pub streaming_uri: String,
    pub quota: Quota,
    pub bucket_capabilities_ver: &'static str,
    pub bucket_capabilities: &'static [&'static str],
    pub controllers: BTreeMap<&'static str, String>,
    pub stats: BucketStatsUris,
    pub nodes: Vec<NodeConfig>,
    pub node_locator: &'static str,
    #[serde(rename = "vBucketServerMap", skip_serializing_if = "Option::is_none")]
    pub vbucket_server_map: Option<VbucketServerMap>,
}

fn server_map(bucket: &Bucket, info: &VbServerInfo) -> Option<VbucketServerMap> {
    if bucket.bucket_type() == BucketType::Memcached {
        return None;
    }
    Some(VbucketServerMap {
        hash_algorithm: "CRC",
        num_replicas: bucket.num_replicas(),
        server_list: info
            .kv_nodes
            .iter()
            .map(|node| format!("{}:{}", node.hostname(), node.port(ServiceType::KeyValue)))
            .collect(),
        vbucket_map: info.vb_map.clone(),
    })
}

fn node_locator(bucket: &Bucket) -> &'static str {
    match bucket.bucket_type() {
        BucketType::Memcached => "ketama",
        BucketType::Membase => "vbucket",
    }
}

fn is_couchbase(bucket: &Bucket) -> bool {
    bucket.bucket_type() != BucketType::Memcached
}

fn bucket_uri(bucket: &Bucket) -> String {
    format!("/pools/default/buckets/{}?bucket_uuid={}", bucket.name(), bucket.id())
}

fn streaming_uri(bucket: &Bucket) -> String {
    format!("/pools/default/bucketsStreaming/{}?bucket_uuid={}", bucket.name(), bucket.id())
}

fn ddocs(bucket: &Bucket) -> Option<UriRef> {
    is_couchbase(bucket).then(|| UriRef {
        uri: format!("/pools/default/buckets/{}/ddocs", bucket.name()),
    })
}

fn manifest_uid(bucket: &Bucket) -> Option<String> {
    is_couchbase(bucket).then(|| format!("{:x}", bucket.collections().rev()))
}

pub fn terse_bucket_config(cluster: &Cluster, bucket: &Bucket, req_node: &ClusterNode) -> TerseBucketConfig {
    let info = vb_server_info(cluster, bucket);
    TerseBucketConfig {
        rev: bucket.config_rev(),
        name: bucket.name().to_string(),
        uuid: bucket.id().to_string(),
        collections_manifest_uid: manifest_uid(bucket),
        uri: bucket_uri(bucket),
        streaming_uri: streaming_uri(bucket),
        ddocs: ddocs(bucket),
        cluster_capabilities_ver: CLUSTER_CAPABILITIES_VER,
        cluster_capabilities: ClusterCapabilities::default(),
        bucket_capabilities_ver: "",
        bucket_capabilities: BUCKET_CAPABILITIES,
        nodes: info
            .all_nodes
            .iter()
            .map(|node| terse_node_config(node, Some(bucket)))
            .collect(),
        nodes_ext: info
            .all_nodes
            .iter()
            .map(|node| ext_node_config(node, req_node))
            .collect(),
        node_locator: node_locator(bucket),
        vbucket_server_map: server_map(bucket, &info),
    }
}

pub fn bucket_config(cluster: &Cluster, bucket: &Bucket, req_node: &ClusterNode) -> BucketConfig {
    let info = vb_server_info(cluster, bucket);
    let settings = bucket.settings();
    let name = bucket.name();

    let mut controllers = BTreeMap::from([
        ("compactAll", format!("/pools/default/buckets/{}/controller/compactBucket", name)),
        ("compactDB", format!("/pools/default/buckets/{}/controller/compactDatabases", name)),
        ("purgeDeletes", format!("/pools/default/buckets/{}/controller/unsafePurgeBucket", name)),
        ("startRecovery", format!("/pools/default/buckets/{}/controller/startRecovery", name)),
    ]);
    if settings.flush_enabled {
        controllers.insert("flush", format!("/pools/default/buckets/{}/controller/doFlush", name));
    }

    BucketConfig {
        rev: bucket.config_rev(),
        name: name.to_string(),
        uuid: bucket.id().to_string(),
        bucket_type: bucket.bucket_type().name(),
        collections_manifest_uid: manifest_uid(bucket),
        durability_min_level: is_couchbase(bucket).then_some("none"),
        ddocs: ddocs(bucket),
        eviction_policy: "valueOnly",
        storage_backend: "couchstore",
        compression_mode: settings.compression_mode.clone(),
        replica_index: settings.replica_index,
        replica_number: bucket.num_replicas(),
        threads_number: 1,
        auth_type: "sasl",
        conflict_resolution_type: "seqno",
        max_ttl: 0,
        local_random_key_uri: format!("/pools/default/buckets/{}/localRandomKey", name),
        uri: bucket_uri(bucket),
        streaming_uri: streaming_uri(bucket),
        quota: Quota {
            ram: settings.ram_quota_mb.saturating_mul(1024 * 1024),
            raw_ram: settings.ram_quota_mb.saturating_mul(1024 * 1024),
        },
        bucket_capabilities_ver: "",
        bucket_capabilities: BUCKET_CAPABILITIES,
        controllers,
        stats: BucketStatsUris {
            uri: format!("/pools/default/buckets/{}/stats", name),
            directory_uri: format!("/pools/default/buckets/{}/stats/Directory", name),
            node_stats_list_uri: format!("/pools/default/buckets/{}/nodes", name),
        },
        nodes: info
            .all_nodes
            .iter()
            .map(|node| node_config(node, req_node, Some(bucket)))
            .collect(),
        node_locator: node_locator(bucket),
        vbucket_server_map: server_map(bucket, &info),
    }
}
