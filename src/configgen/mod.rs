//! Config documents describing cluster, bucket and node state.
//!
//! Every document is a typed struct serialized with serde, so the JSON
//! layout clients parse is visible in the field list. Node entries are
//! generated relative to the node that serves the request (`thisNode`).

mod bucket;
mod node;

use serde::Serialize;

pub use bucket::{
    BucketConfig, TerseBucketConfig, VbServerInfo, VbucketServerMap, bucket_config, terse_bucket_config,
    vb_server_info,
};
pub use node::{ExtNodeConfig, NodeConfig, TerseNodeConfig, ext_node_config, node_config, terse_node_config};

use crate::cluster::{Cluster, ClusterNode};

const CLUSTER_CAPABILITIES_VER: [u32; 2] = [1, 0];

const IMPLEMENTATION_VERSION: &str = "7.0.0-3016-enterprise";

#[derive(Debug, Clone, Serialize)]
pub struct ClusterCapabilities {
    pub n1ql: &'static [&'static str],
}

impl Default for ClusterCapabilities {
    fn default() -> Self {
        Self {
            n1ql: &[
                "costBasedOptimizer",
                "indexAdvisor",
                "javaScriptFunctions",
                "inlineFunctions",
                "enhancedPreparedStatements",
            ],
        }
    }
}

/// Cluster config without a bucket: served over CCCP before SELECT_BUCKET
/// and by `/pools/default/nodeServices`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerseClusterConfig {
    pub rev: u64,
    pub nodes_ext: Vec<ExtNodeConfig>,
    pub cluster_capabilities_ver: [u32; 2],
    pub cluster_capabilities: ClusterCapabilities,
}

/// `/pools/default`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub name: &'static str,
    pub rev: u64,
    pub nodes: Vec<NodeConfig>,
    pub buckets: PoolBuckets,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolBuckets {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRef {
    pub name: &'static str,
    pub uri: String,
    pub streaming_uri: String,
}

/// `/pools`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolsConfig {
    pub uuid: String,
    pub is_enterprise: bool,
    pub is_admin_creds: bool,
    #[serde(rename = "isROAdminCreds")]
    pub is_ro_admin_creds: bool,
    pub allowed_services: &'static [&'static str],
    #[serde(rename = "isIPv6")]
    pub is_ipv6: bool,
    pub is_developer_preview: bool,
    pub package_variant: &'static str,
    pub pools: Vec<PoolRef>,
    pub implementation_version: &'static str,
}

pub fn terse_cluster_config(cluster: &Cluster, req_node: &ClusterNode) -> TerseClusterConfig {
    TerseClusterConfig {
        rev: cluster.config_rev(),
        nodes_ext: cluster
            .nodes()
            .iter()
            .map(|node| ext_node_config(node, req_node))
            .collect(),
        cluster_capabilities_ver: CLUSTER_CAPABILITIES_VER,
        cluster_capabilities: ClusterCapabilities::default(),
    }
}

pub fn pool_config(cluster: &Cluster, req_node: &ClusterNode) -> PoolConfig {
    PoolConfig {
        name: "default",
        rev: cluster.config_rev(),
        nodes: cluster
            .nodes()
            .iter()
            .map(|node| node_config(node, req_node, None))
            .collect(),
        buckets: PoolBuckets {
            uri: format!("/pools/default/buckets?v={}", cluster.config_rev()),
        },
    }
}

pub fn pools_config(cluster: &Cluster) -> PoolsConfig {
    let uuid = cluster.id().replace('-', "");
    PoolsConfig {
        is_enterprise: true,
        is_admin_creds: true,
        is_ro_admin_creds: false,
        allowed_services: &["kv", "n1ql", "index", "fts", "cbas", "eventing", "backup"],
        is_ipv6: false,
        is_developer_preview: false,
        package_variant: "centos7",
        pools: vec![PoolRef {
            name: "default",
            uri: format!("/pools/default?uuid={}", uuid),
            streaming_uri: format!("/poolsStreaming/default?uuid={}", uuid),
        }],
        implementation_version: IMPLEMENTATION_VERSION,
        uuid,
    }
}
