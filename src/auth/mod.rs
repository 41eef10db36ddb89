//! Users, roles and SASL authentication.
//!
//! The [`AuthEngine`] is shared by the KV service (SASL over the binary
//! protocol) and the HTTP services (Basic credentials). Roles come from a
//! fixed table in [`permission`]; users may hold roles directly or through
//! groups.

mod engine;
mod error;
pub mod permission;
pub mod scram;

pub use engine::{
    AuthEngine, DEFAULT_ADMIN_PASSWORD, DEFAULT_ADMIN_USER, Group, UpsertUserOptions, User,
    UserRole,
};
pub use error::{AuthError, ScramError};
pub use permission::{Permission, ROLES, RoleInfo, role_info};
pub use scram::{Mechanism, SUPPORTED_MECHANISMS, ScramServer, parse_plain};
