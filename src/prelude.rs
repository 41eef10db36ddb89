//! Convenient re-exports for common usage patterns.
//!
//! ```ignore
//! use caves::prelude::*;
//!
//! let cluster = Cluster::new(ClusterOptions::default()).await?;
//! let mut cancel = CancelSource::new();
//! cluster.hooks().kv_in.expect().key("k").wait(&mut cancel.token()).await?;
//! ```

// Unified error handling
pub use crate::error::{Error, Result};

// Cluster orchestration
pub use crate::clock::Chrono;
pub use crate::cluster::{
    Bucket, BucketOptions, BucketType, Cluster, ClusterError, ClusterHooks, ClusterInfo,
    ClusterNode, ClusterOptions, NodeOptions,
};
pub use crate::services::ServiceType;

// Hooks and expectations
pub use crate::hooks::{Cancel, CancelSource, HookResult, HttpExpect, KvExpect, PathTemplate};

// Users and roles
pub use crate::auth::{DEFAULT_ADMIN_PASSWORD, DEFAULT_ADMIN_USER, UpsertUserOptions, UserRole};

// Harness control
pub use crate::control::{Command, ControlHandler};

pub use std::time::Duration;
