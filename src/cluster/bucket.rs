//! A bucket: document store, collection manifest, vbucket map and settings.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::ClusterError;
use crate::clock::Chrono;
use crate::collections::{CollectionManifest, ManifestError};
use crate::kvproc::Engine;
use crate::logging::{debug, info};
use crate::store;

/// Storage flavour of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    #[default]
    #[serde(alias = "couchbase")]
    Membase,
    Memcached,
}

impl BucketType {
    pub fn name(self) -> &'static str {
        match self {
            BucketType::Membase => "membase",
            BucketType::Memcached => "memcached",
        }
    }

    /// Parse the `bucketType` form field. Unknown values fall back to membase.
    pub fn parse(text: &str) -> Self {
        match text {
            "memcached" => BucketType::Memcached,
            _ => BucketType::Membase,
        }
    }
}

impl std::fmt::Display for BucketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Options for [`Cluster::add_bucket`](super::Cluster::add_bucket).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketOptions {
    pub name: String,
    #[serde(rename = "type")]
    pub bucket_type: BucketType,
    pub replicas: u32,
    pub flush_enabled: bool,
    pub ram_quota_mb: u64,
    pub replica_index: bool,
    pub compression_mode: String,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            bucket_type: BucketType::Membase,
            replicas: 1,
            flush_enabled: false,
            ram_quota_mb: 100,
            replica_index: false,
            compression_mode: "passive".to_string(),
        }
    }
}

/// Settings that can be changed after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSettings {
    pub replicas: u32,
    pub flush_enabled: bool,
    pub ram_quota_mb: u64,
    pub replica_index: bool,
    pub compression_mode: String,
}

/// A view definition inside a design document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub map: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reduce: String,
}

/// A design document as the views REST API exchanges it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignDocument {
    #[serde(default)]
    pub views: BTreeMap<String, ViewDefinition>,
}

/// The part of the cluster a bucket needs to reach.
pub(crate) trait ClusterView: Send + Sync {
    fn bucket_changed(&self, rev: u64);
}

#[derive(Debug)]
struct Topology {
    settings: BucketSettings,
    /// Node id per vbucket and replica index.
    vb_map: Vec<Vec<Option<String>>>,
    config_rev: u64,
}

/// A bucket of the mock cluster.
pub struct Bucket {
    id: String,
    name: String,
    bucket_type: BucketType,
    num_vbuckets: u16,
    chrono: Chrono,
    created: SystemTime,
    store: Arc<store::Bucket>,
    manifest: CollectionManifest,
    design_docs: RwLock<BTreeMap<String, DesignDocument>>,
    topology: RwLock<Topology>,
    cluster: Weak<dyn ClusterView>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("bucket_type", &self.bucket_type)
            .field("config_rev", &self.config_rev())
            .finish()
    }
}

/// Storage parameters the cluster hands to every new bucket.
#[derive(Debug, Clone)]
pub(crate) struct StoreParams {
    pub chrono: Chrono,
    pub num_vbuckets: u16,
    pub replica_latency: Duration,
    pub persist_latency: Duration,
}

impl Bucket {
    pub(crate) fn new(
        opts: &BucketOptions,
        params: &StoreParams,
        cluster: Weak<dyn ClusterView>,
    ) -> Result<Self, ClusterError> {
        validate_name(&opts.name)?;

        // Memcached buckets have one vbucket and no replicas
        let (num_vbuckets, replicas) = match opts.bucket_type {
            BucketType::Membase => (params.num_vbuckets, opts.replicas),
            BucketType::Memcached => (1, 0),
        };
        let store = store::Bucket::new(store::BucketOptions {
            chrono: params.chrono.clone(),
            num_vbuckets,
            replica_latency: params.replica_latency,
            persist_latency: params.persist_latency,
        })?;

        info!(bucket = %opts.name, bucket_type = %opts.bucket_type, replicas, "bucket created");
        Ok(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: opts.name.clone(),
            bucket_type: opts.bucket_type,
            num_vbuckets,
            chrono: params.chrono.clone(),
            created: params.chrono.now(),
            store: Arc::new(store),
            manifest: CollectionManifest::new(),
            design_docs: RwLock::new(BTreeMap::new()),
            topology: RwLock::new(Topology {
                settings: BucketSettings {
                    replicas,
                    flush_enabled: opts.flush_enabled,
                    ram_quota_mb: opts.ram_quota_mb,
                    replica_index: opts.replica_index,
                    compression_mode: opts.compression_mode.clone(),
                },
                vb_map: Vec::new(),
                config_rev: 0,
            }),
            cluster,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket_type(&self) -> BucketType {
        self.bucket_type
    }

    pub fn num_vbuckets(&self) -> u16 {
        self.num_vbuckets
    }

    pub fn num_replicas(&self) -> u32 {
        self.topology.read().settings.replicas
    }

    pub fn settings(&self) -> BucketSettings {
        self.topology.read().settings.clone()
    }

    pub fn config_rev(&self) -> u64 {
        self.topology.read().config_rev
    }

    pub fn store(&self) -> &Arc<store::Bucket> {
        &self.store
    }

    pub fn chrono(&self) -> &Chrono {
        &self.chrono
    }

    /// Logical time at which the bucket was created.
    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Read access to the collection manifest. Changes go through the
    /// bucket so that they bump its config revision.
    pub fn collections(&self) -> &CollectionManifest {
        &self.manifest
    }

    /// Node ids per vbucket and replica index.
    pub fn vb_map(&self) -> Vec<Vec<Option<String>>> {
        self.topology.read().vb_map.clone()
    }

    /// Assign vbuckets to nodes: replica `r` of vbucket `v` goes to
    /// `nodes[(v + r) % nodes.len()]`, and replicas beyond the node count stay
    /// unassigned.
    pub fn update_vb_map(&self, node_ids: &[String]) {
        let rev = {
            let mut topology = self.topology.write();
            let copies = usize::try_from(topology.settings.replicas)
                .unwrap_or(usize::MAX)
                .saturating_add(1);
            topology.vb_map = (0..usize::from(self.num_vbuckets))
                .map(|vb| {
                    (0..copies)
                        .map(|rep| {
                            if rep >= node_ids.len() {
                                return None;
                            }
                            node_ids.get((vb + rep) % node_ids.len()).cloned()
                        })
                        .collect()
                })
                .collect();
            topology.config_rev += 1;
            topology.config_rev
        };
        debug!(bucket = %self.name, nodes = node_ids.len(), rev, "vbucket map updated");
        self.notify(rev);
    }

    /// Replica index `node_id` holds for every vbucket, `None` when it holds none.
    pub fn vbucket_ownership(&self, node_id: &str) -> Vec<Option<usize>> {
        self.topology
            .read()
            .vb_map
            .iter()
            .map(|replicas| {
                replicas
                    .iter()
                    .position(|owner| owner.as_deref() == Some(node_id))
            })
            .collect()
    }

    /// KV operations on this bucket as seen from `node_id`.
    ///
    /// Memcached buckets are routed by the client with ketama hashing, so
    /// every node serves their single vbucket as active.
    pub fn engine_for(&self, node_id: &str) -> Engine {
        let ownership = match self.bucket_type {
            BucketType::Memcached => vec![Some(0)],
            BucketType::Membase => self.vbucket_ownership(node_id),
        };
        Engine::new(Arc::clone(&self.store), self.chrono.clone(), ownership)
    }

    pub fn update_settings(&self, settings: BucketSettings) {
        let rev = {
            let mut topology = self.topology.write();
            if self.bucket_type == BucketType::Memcached {
                topology.settings = BucketSettings {
                    replicas: 0,
                    ..settings
                };
            } else {
                topology.settings = settings;
            }
            topology.config_rev += 1;
            topology.config_rev
        };
        self.notify(rev);
    }

    /// Drop every document, keeping settings and collections.
    pub fn flush(&self) {
        self.store.flush();
        info!(bucket = %self.name, "bucket flushed");
        let rev = self.bump_rev();
        self.notify(rev);
    }

    pub fn create_scope(&self, scope: &str) -> Result<u64, ManifestError> {
        let uid = self.manifest.add_scope(scope)?;
        self.manifest_changed();
        Ok(uid)
    }

    pub fn drop_scope(&self, scope: &str) -> Result<u64, ManifestError> {
        let uid = self.manifest.drop_scope(scope)?;
        self.manifest_changed();
        Ok(uid)
    }

    pub fn create_collection(&self, scope: &str, collection: &str, max_ttl: u32) -> Result<u64, ManifestError> {
        let uid = self.manifest.add_collection(scope, collection, max_ttl)?;
        self.manifest_changed();
        Ok(uid)
    }

    pub fn drop_collection(&self, scope: &str, collection: &str) -> Result<u64, ManifestError> {
        let uid = self.manifest.drop_collection(scope, collection)?;
        self.manifest_changed();
        Ok(uid)
    }

    fn manifest_changed(&self) {
        let rev = self.bump_rev();
        debug!(bucket = %self.name, manifest_rev = self.manifest.rev(), rev, "collection manifest changed");
        self.notify(rev);
    }

    pub fn design_documents(&self) -> BTreeMap<String, DesignDocument> {
        self.design_docs.read().clone()
    }

    pub fn design_document(&self, name: &str) -> Option<DesignDocument> {
        self.design_docs.read().get(name).cloned()
    }

    pub fn upsert_design_document(&self, name: &str, ddoc: DesignDocument) {
        self.design_docs.write().insert(name.to_string(), ddoc);
    }

    /// Remove a design document, returning whether it existed.
    pub fn drop_design_document(&self, name: &str) -> bool {
        self.design_docs.write().remove(name).is_some()
    }

    fn bump_rev(&self) -> u64 {
        let mut topology = self.topology.write();
        topology.config_rev += 1;
        topology.config_rev
    }

    fn notify(&self, rev: u64) {
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.bucket_changed(rev);
        }
    }
}

fn validate_name(name: &str) -> Result<(), ClusterError> {
    let valid = !name.is_empty()
        && name.len() <= 100
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '%'));
    if valid {
        Ok(())
    } else {
        Err(ClusterError::InvalidBucketName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCluster;

    impl ClusterView for NoCluster {
        fn bucket_changed(&self, _rev: u64) {}
    }

    fn bucket(bucket_type: BucketType, replicas: u32) -> Bucket {
        let weak: Weak<dyn ClusterView> = Weak::<NoCluster>::new();
        Bucket::new(
            &BucketOptions {
                name: "default".to_string(),
                bucket_type,
                replicas,
                ..Default::default()
            },
            &StoreParams {
                chrono: Chrono::new(),
                num_vbuckets: 8,
                replica_latency: Duration::from_millis(50),
                persist_latency: Duration::from_millis(100),
            },
            weak,
        )
        .unwrap()
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn vb_map_rotates_replicas_over_nodes() {
        let b = bucket(BucketType::Membase, 1);
        b.update_vb_map(&ids(&["a", "b", "c"]));
        let map = b.vb_map();
        assert_eq!(map.len(), 8);
        assert_eq!(map.first().unwrap(), &vec![Some("a".to_string()), Some("b".to_string())]);
        assert_eq!(map.get(2).unwrap(), &vec![Some("c".to_string()), Some("a".to_string())]);
    }

    #[test]
    fn replicas_beyond_node_count_are_unassigned() {
        let b = bucket(BucketType::Membase, 2);
        b.update_vb_map(&ids(&["a"]));
        assert_eq!(b.vb_map().get(5).unwrap(), &vec![Some("a".to_string()), None, None]);
        assert_eq!(b.vbucket_ownership("a"), vec![Some(0); 8]);
        assert_eq!(b.vbucket_ownership("z"), vec![None; 8]);
    }

    #[test]
    fn memcached_buckets_have_one_vbucket_and_no_replicas() {
        let b = bucket(BucketType::Memcached, 2);
        b.update_vb_map(&ids(&["a", "b"]));
        assert_eq!(b.num_vbuckets(), 1);
        assert_eq!(b.num_replicas(), 0);
        assert_eq!(b.vb_map(), vec![vec![Some("a".to_string())]]);
    }

    #[test]
    fn topology_and_manifest_changes_bump_rev() {
        let b = bucket(BucketType::Membase, 1);
        b.update_vb_map(&ids(&["a"]));
        let rev = b.config_rev();
        b.create_scope("inventory").unwrap();
        assert_eq!(b.config_rev(), rev + 1);
        b.create_collection("inventory", "hotels", 0).unwrap();
        assert_eq!(b.config_rev(), rev + 2);
        assert!(b.create_scope("inventory").is_err());
        assert_eq!(b.config_rev(), rev + 2);
    }

    #[test]
    fn rejects_bad_names() {
        assert!(validate_name("travel-sample").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(".hidden").is_err());
    }
}
