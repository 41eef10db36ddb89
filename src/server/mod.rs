//! Standalone server support: configuration, logging setup and cluster bootstrap.
//!
//! The `caves-server` binary is a thin wrapper around this module. It reads a
//! TOML [`Config`], installs a tracing subscriber, starts a [`Cluster`] shaped
//! by the `[cluster]` and `[[buckets]]` sections, then optionally exposes the
//! harness control channel.

mod config;
mod logging;

use crate::cluster::{Cluster, ClusterError};
use crate::logging::info;

pub use config::{ClusterConfig, Config, ConfigError, LogFormat, LoggingConfig, ServerConfig};
pub use logging::{LoggingError, init as init_logging};

/// Start a cluster with the configured nodes and buckets.
pub async fn start_cluster(config: &Config) -> Result<Cluster, ClusterError> {
    let cluster = Cluster::new(config.cluster.cluster_options()).await?;
    for _ in 1..config.cluster.nodes {
        cluster.add_node(config.cluster.node_options()).await?;
    }
    for bucket in &config.buckets {
        if let Err(err) = cluster.add_bucket(bucket.clone()) {
            cluster.close();
            return Err(err);
        }
    }
    info!(
        id = cluster.id(),
        nodes = cluster.nodes().len(),
        buckets = cluster.buckets().len(),
        "cluster started"
    );
    Ok(cluster)
}
