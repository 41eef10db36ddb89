//! Logging macros used throughout the mock cluster.
//!
//! With the `logging` feature these forward to tracing; without it they
//! expand to nothing, so embedding the mock in a test binary costs no
//! subscriber and no formatting.
//!
//! Events carry their module path as the target: `caves::services::kv` for
//! connections and packet dispatch, `caves::handlers` for per-command
//! decisions, `caves::store` for vbucket writes and rollbacks,
//! `caves::control` for the test harness protocol and `caves::clock` for
//! time travel. Packet-level detail is at trace, so `caves=debug` is the
//! useful default and `caves::services::kv=trace` shows every frame. The
//! server binary reads the filter from `[logging] level` or `--log-level`.
//!
//! ```rust,ignore
//! use crate::logging::{debug, info};
//!
//! info!(port = listener.local_addr()?.port(), "kv service listening");
//! debug!(opcode = %pak.command, opaque = pak.opaque, "dispatching packet");
//! ```

/// Packet frames and clock movement.
#[cfg(feature = "logging")]
macro_rules! log_trace {
    ($($arg:tt)*) => { tracing::trace!($($arg)*) }
}

#[cfg(not(feature = "logging"))]
macro_rules! log_trace {
    ($($arg:tt)*) => {};
}

/// Per-command decisions: rejected auth, CAS conflicts, stream setup.
#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) }
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

/// Cluster lifecycle: nodes, buckets, listeners, test runs.
#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => { tracing::info!($($arg)*) }
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {};
}

/// Peers that misbehave: bad frames, dropped connections, unknown commands.
#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) }
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {};
}

pub(crate) use log_debug as debug;
pub(crate) use log_info as info;
pub(crate) use log_trace as trace;
pub(crate) use log_warn as warn;
