//! Cluster orchestration: nodes, buckets, hook chains and config revisions.
//!
//! A [`Cluster`] is a cheap handle over shared state. Nodes and buckets only
//! keep weak references back to it, so dropping the last handle tears the
//! whole cluster down.

mod bucket;
mod node;
mod watcher;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bucket::{
    Bucket, BucketOptions, BucketSettings, BucketType, DesignDocument, ViewDefinition,
};
pub use node::{ClusterNode, DEFAULT_HOSTNAME, NodeOptions};
pub use watcher::{ConfigSubscription, ConfigWatcher, WatcherId};

use bucket::{ClusterView, StoreParams};
use crate::auth::AuthEngine;
use crate::clock::Chrono;
use crate::hooks::{HttpHooks, KvHooks};
use crate::logging::{debug, info};
use crate::services::{Service, ServiceError, ServiceType};
use crate::store::StoreError;

/// Most replicas a bucket may have.
pub const MAX_REPLICAS: u32 = 3;

/// Errors raised by cluster operations.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Bucket with given name already exists")]
    BucketExists(String),

    #[error("Bucket name can only contain characters in range A-Z, a-z, 0-9 as well as underscore, period, dash & percent")]
    InvalidBucketName(String),

    #[error("Replica number must be between 0 and {MAX_REPLICAS}, got {0}")]
    InvalidReplicas(u32),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Options for [`Cluster::new`].
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub chrono: Chrono,
    pub num_vbuckets: u16,
    pub replica_latency: Duration,
    pub persist_latency: Duration,
    pub initial_node: NodeOptions,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            chrono: Chrono::new(),
            num_vbuckets: 1024,
            replica_latency: Duration::from_millis(50),
            persist_latency: Duration::from_millis(100),
            initial_node: NodeOptions::default(),
        }
    }
}

/// The hook chains of a cluster, one per protocol surface.
#[derive(Debug, Clone, Default)]
pub struct ClusterHooks {
    pub kv_in: KvHooks,
    pub kv_out: KvHooks,
    pub mgmt: HttpHooks,
    pub views: HttpHooks,
    pub query: HttpHooks,
    pub search: HttpHooks,
    pub analytics: HttpHooks,
}

impl ClusterHooks {
    /// The chain requests to an HTTP service of type `service` go through.
    pub fn http(&self, service: ServiceType) -> Option<&HttpHooks> {
        match service {
            ServiceType::KeyValue => None,
            ServiceType::Mgmt => Some(&self.mgmt),
            ServiceType::Views => Some(&self.views),
            ServiceType::Query => Some(&self.query),
            ServiceType::Search => Some(&self.search),
            ServiceType::Analytics => Some(&self.analytics),
        }
    }

    /// Child chains whose hooks can be removed together with [`destroy`](Self::destroy).
    pub fn child(&self) -> Self {
        Self {
            kv_in: self.kv_in.child(),
            kv_out: self.kv_out.child(),
            mgmt: self.mgmt.child(),
            views: self.views.child(),
            query: self.query.child(),
            search: self.search.child(),
            analytics: self.analytics.child(),
        }
    }

    pub fn destroy(&self) {
        self.kv_in.destroy();
        self.kv_out.destroy();
        self.mgmt.destroy();
        self.views.destroy();
        self.query.destroy();
        self.search.destroy();
        self.analytics.destroy();
    }
}

/// Summary of a cluster for logs and harness replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub id: String,
    pub connection_string: String,
    pub mgmt_addrs: Vec<String>,
}

pub(crate) struct ClusterInner {
    id: String,
    store_params: StoreParams,
    config_rev: AtomicU64,
    nodes: RwLock<Vec<Arc<ClusterNode>>>,
    buckets: RwLock<Vec<Arc<Bucket>>>,
    watchers: Mutex<Vec<(WatcherId, Arc<dyn ConfigWatcher>)>>,
    next_watcher: AtomicU64,
    auth: AuthEngine,
    hooks: ClusterHooks,
}

impl ClusterInner {
    fn node_ids(&self) -> Vec<String> {
        self.nodes.read().iter().map(|n| n.id().to_string()).collect()
    }

    pub(crate) fn add_watcher(&self, watcher: Arc<dyn ConfigWatcher>) -> WatcherId {
        let id = WatcherId(self.next_watcher.fetch_add(1, Ordering::Relaxed));
        self.watchers.lock().push((id, watcher));
        id
    }

    pub(crate) fn remove_watcher(&self, id: WatcherId) {
        self.watchers.lock().retain(|(w, _)| *w != id);
    }

    fn notify_watchers(&self, rev: u64) {
        let watchers = self.watchers.lock();
        for (_, watcher) in watchers.iter() {
            watcher.on_new_config(rev);
        }
    }

    fn bump_config(&self) -> u64 {
        let rev = self.config_rev.fetch_add(1, Ordering::SeqCst) + 1;
        self.notify_watchers(rev);
        rev
    }
}

impl ClusterView for ClusterInner {
    fn bucket_changed(&self, rev: u64) {
        self.notify_watchers(rev);
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        for node in self.nodes.get_mut().iter() {
            node.close();
        }
    }
}

/// Handle to a mock cluster. Cloning shares the same cluster.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.inner.id)
            .field("config_rev", &self.config_rev())
            .finish()
    }
}

impl Cluster {
    /// Create a cluster with one node and the built-in handlers registered.
    pub async fn new(opts: ClusterOptions) -> Result<Self, ClusterError> {
        let inner = Arc::new(ClusterInner {
            id: uuid::Uuid::new_v4().to_string(),
            store_params: StoreParams {
                chrono: opts.chrono,
                num_vbuckets: opts.num_vbuckets.max(1),
                replica_latency: opts.replica_latency,
                persist_latency: opts.persist_latency,
            },
            config_rev: AtomicU64::new(0),
            nodes: RwLock::new(Vec::new()),
            buckets: RwLock::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            next_watcher: AtomicU64::new(1),
            auth: AuthEngine::new(),
            hooks: ClusterHooks::default(),
        });
        crate::handlers::register(&inner.hooks);

        let cluster = Self { inner };
        cluster.add_node(opts.initial_node).await?;
        info!(cluster = %cluster.id(), "cluster created");
        Ok(cluster)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn chrono(&self) -> &Chrono {
        &self.inner.store_params.chrono
    }

    pub fn auth(&self) -> &AuthEngine {
        &self.inner.auth
    }

    pub fn hooks(&self) -> &ClusterHooks {
        &self.inner.hooks
    }

    pub fn config_rev(&self) -> u64 {
        self.inner.config_rev.load(Ordering::SeqCst)
    }

    pub fn num_vbuckets(&self) -> u16 {
        self.inner.store_params.num_vbuckets
    }

    pub fn nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.inner.nodes.read().clone()
    }

    /// Start a node and rebalance every bucket over the new node list.
    pub async fn add_node(&self, opts: NodeOptions) -> Result<Arc<ClusterNode>, ClusterError> {
        let node = ClusterNode::start(Arc::downgrade(&self.inner), &opts).await?;
        self.inner.nodes.write().push(Arc::clone(&node));

        let node_ids = self.inner.node_ids();
        for bucket in self.buckets() {
            bucket.update_vb_map(&node_ids);
        }
        let rev = self.inner.bump_config();
        info!(node = %node.id(), nodes = node_ids.len(), rev, "node added");
        Ok(node)
    }

    pub fn add_bucket(&self, opts: BucketOptions) -> Result<Arc<Bucket>, ClusterError> {
        if opts.replicas > MAX_REPLICAS {
            return Err(ClusterError::InvalidReplicas(opts.replicas));
        }
        if self.get_bucket(&opts.name).is_some() {
            return Err(ClusterError::BucketExists(opts.name));
        }

        let weak = Arc::downgrade(&self.inner);
        let view: Weak<dyn ClusterView> = weak;
        let bucket = Arc::new(Bucket::new(&opts, &self.inner.store_params, view)?);
        bucket.update_vb_map(&self.inner.node_ids());

        {
            let mut buckets = self.inner.buckets.write();
            if buckets.iter().any(|b| b.name() == opts.name) {
                return Err(ClusterError::BucketExists(opts.name));
            }
            buckets.push(Arc::clone(&bucket));
        }
        let rev = self.inner.bump_config();
        debug!(bucket = %opts.name, rev, "bucket added");
        Ok(bucket)
    }

    pub fn get_bucket(&self, name: &str) -> Option<Arc<Bucket>> {
        self.inner
            .buckets
            .read()
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    pub fn buckets(&self) -> Vec<Arc<Bucket>> {
        self.inner.buckets.read().clone()
    }

    pub fn delete_bucket(&self, name: &str) -> Result<(), ClusterError> {
        {
            let mut buckets = self.inner.buckets.write();
            let before = buckets.len();
            buckets.retain(|b| b.name() != name);
            if buckets.len() == before {
                return Err(ClusterError::BucketNotFound(name.to_string()));
            }
        }
        let rev = self.inner.bump_config();
        info!(bucket = %name, rev, "bucket deleted");
        Ok(())
    }

    /// `couchbase://host:port,...` over every node's KV listener.
    pub fn connection_string(&self) -> String {
        let hosts: Vec<String> = self
            .nodes()
            .iter()
            .filter_map(|node| {
                node.kv_service()
                    .map(|kv| format!("{}:{}", kv.hostname(), kv.listen_port()))
            })
            .collect();
        format!("couchbase://{}", hosts.join(","))
    }

    /// `http://host:port` of every node's management listener.
    pub fn mgmt_addrs(&self) -> Vec<String> {
        self.nodes()
            .iter()
            .filter_map(|node| {
                node.mgmt_service()
                    .map(|mgmt| format!("http://{}:{}", mgmt.hostname(), mgmt.listen_port()))
            })
            .collect()
    }

    pub fn info(&self) -> ClusterInfo {
        ClusterInfo {
            id: self.id().to_string(),
            connection_string: self.connection_string(),
            mgmt_addrs: self.mgmt_addrs(),
        }
    }

    pub fn add_config_watcher(&self, watcher: Arc<dyn ConfigWatcher>) -> WatcherId {
        self.inner.add_watcher(watcher)
    }

    pub fn remove_config_watcher(&self, id: WatcherId) {
        self.inner.remove_watcher(id);
    }

    /// Subscribe to config changes through a channel.
    pub fn watch_config(&self) -> ConfigSubscription {
        ConfigSubscription::register(&self.inner)
    }

    /// Stop every node's listeners.
    pub fn close(&self) {
        for node in self.nodes() {
            node.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv_only() -> ClusterOptions {
        ClusterOptions {
            num_vbuckets: 16,
            initial_node: NodeOptions {
                services: vec![ServiceType::KeyValue],
            },
            ..Default::default()
        }
    }

    fn bucket(name: &str) -> BucketOptions {
        BucketOptions {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn buckets_are_unique_by_name() -> anyhow::Result<()> {
        let cluster = Cluster::new(kv_only()).await?;
        cluster.add_bucket(bucket("default"))?;
        let err = cluster.add_bucket(bucket("default")).unwrap_err();
        assert!(matches!(err, ClusterError::BucketExists(_)));
        assert_eq!(cluster.buckets().len(), 1);

        cluster.delete_bucket("default")?;
        assert!(cluster.get_bucket("default").is_none());
        assert!(matches!(
            cluster.delete_bucket("default"),
            Err(ClusterError::BucketNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn adding_a_node_rebalances_buckets() -> anyhow::Result<()> {
        let cluster = Cluster::new(kv_only()).await?;
        let b = cluster.add_bucket(bucket("default"))?;
        let rev = b.config_rev();
        let first = cluster.nodes().first().map(|n| n.id().to_string()).unwrap_or_default();
        assert_eq!(b.vbucket_ownership(&first), vec![Some(0); 16]);

        let second = cluster
            .add_node(NodeOptions {
                services: vec![ServiceType::KeyValue],
            })
            .await?;
        assert_eq!(b.config_rev(), rev + 1);
        let owned = b.vbucket_ownership(second.id());
        assert_eq!(owned.first().copied().flatten(), Some(1));
        assert_eq!(owned.get(1).copied().flatten(), Some(0));
        assert_eq!(cluster.connection_string().matches(',').count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn watchers_see_cluster_and_bucket_changes() -> anyhow::Result<()> {
        let cluster = Cluster::new(kv_only()).await?;
        let mut sub = cluster.watch_config();
        cluster.add_bucket(bucket("default"))?;
        assert!(sub.changed().await.is_some());

        let b = cluster.get_bucket("default").unwrap();
        b.create_scope("inventory")?;
        assert_eq!(sub.changed().await, Some(b.config_rev()));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_too_many_replicas() -> anyhow::Result<()> {
        let cluster = Cluster::new(kv_only()).await?;
        let err = cluster
            .add_bucket(BucketOptions {
                replicas: 4,
                ..bucket("default")
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidReplicas(4)));
        Ok(())
    }
}
