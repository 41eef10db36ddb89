//! Error types for the auth module.

use thiserror::Error;

/// Errors raised by the user registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Username is required")]
    MissingUsername,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Invalid group name: {0:?}")]
    InvalidGroup(String),

    #[error("Malformed role: {0}")]
    InvalidRole(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),
}

/// Errors raised during a SASL exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("Unsupported mechanism: {0}")]
    UnsupportedMechanism(String),

    #[error("Malformed SASL message: {0}")]
    Malformed(&'static str),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Nonce mismatch")]
    NonceMismatch,

    #[error("Client proof did not verify")]
    BadProof,

    #[error("Invalid key length")]
    InvalidKey,
}
