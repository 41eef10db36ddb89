//! In-process mock of a Couchbase-style document database cluster.
//!
//! `caves` starts real listeners on localhost: one binary KV (memcached
//! protocol) port and a set of HTTP ports per node. SDK test suites point
//! their connection string at it and exercise CRUD, sub-document, DCP,
//! SASL, bucket and user management without a real server.
//!
//! # Quick Start
//!
//! ```ignore
//! use caves::prelude::*;
//!
//! let cluster = Cluster::new(ClusterOptions::default()).await?;
//! cluster.add_bucket(BucketOptions { name: "default".into(), ..Default::default() })?;
//! println!("{}", cluster.connection_string());
//!
//! // Move expiry and lock timers forward without sleeping.
//! cluster.chrono().time_travel(Duration::from_secs(60));
//! ```
//!
//! # Modules
//!
//! - [`cluster`] - Nodes, buckets, hook chains and config revisions
//! - [`store`] - Versioned vbucket document storage
//! - [`kvproc`] - Key-value and sub-document operation semantics
//! - [`memd`] - Binary protocol packets, opcodes, status codes and features
//! - [`services`] - KV and HTTP listeners
//! - [`hooks`] - Interceptable middleware chains and expectations
//! - [`auth`] - Users, roles, groups and SASL
//! - [`configgen`] - Cluster and bucket config JSON
//! - [`control`] - Harness control channel
//! - [`clock`] - Logical clock with time travel
//!
//! # Feature Flags
//!
//! - `logging` - Enable library-level tracing (consumers provide their own subscriber)
//! - `server` - Enable the `caves-server` binary support (config file, logging setup, CLI)
//! - `full` - Enable all features

pub mod auth;
pub mod clock;
pub mod cluster;
pub mod collections;
pub mod configgen;
pub mod control;
mod handlers;
pub mod hooks;
pub mod kvproc;
mod logging;
pub mod memd;
pub mod prelude;
#[cfg(feature = "server")]
pub mod server;
pub mod services;
pub mod store;

mod error;

// Re-export the unified error type
pub use error::{Error, Result};

// Re-export the types most embedders need at the crate root
pub use clock::Chrono;
pub use cluster::{
    Bucket, BucketOptions, BucketType, Cluster, ClusterError, ClusterHooks, ClusterInfo,
    ClusterNode, ClusterOptions, NodeOptions,
};
pub use control::{ControlError, ControlHandler};
pub use services::ServiceType;
