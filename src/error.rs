//! Unified error type for the crate.

use thiserror::Error;

use crate::auth::AuthError;
use crate::cluster::ClusterError;
use crate::collections::ManifestError;
use crate::control::ControlError;
use crate::hooks::HookError;
use crate::kvproc::ProcError;
use crate::memd::PacketError;
use crate::services::ServiceError;
use crate::store::StoreError;

/// Any error the mock can surface to an embedding program.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Proc(#[from] ProcError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if a named bucket does not exist.
    pub fn is_bucket_not_found(&self) -> bool {
        matches!(
            self,
            Error::Cluster(ClusterError::BucketNotFound(_))
                | Error::Control(ControlError::Cluster(ClusterError::BucketNotFound(_)))
        )
    }

    /// Returns true for errors caused by invalid caller input rather than mock state.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Error::Cluster(ClusterError::InvalidBucketName(_) | ClusterError::InvalidReplicas(_))
                | Error::Manifest(_)
                | Error::Packet(_)
                | Error::Control(
                    ControlError::Json(_) | ControlError::TruncatedFrame(_) | ControlError::FrameTooLarge(_)
                )
        )
    }

    /// Returns true for transport failures.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Control(ControlError::Io(_)))
    }
}

/// Result type alias using the crate's error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_wrapped_errors() {
        let err: Error = ClusterError::BucketNotFound("b".to_string()).into();
        assert!(err.is_bucket_not_found());
        assert!(!err.is_invalid_input());

        let err: Error = ClusterError::InvalidReplicas(9).into();
        assert!(err.is_invalid_input());
        assert_eq!(err.to_string(), ClusterError::InvalidReplicas(9).to_string());

        let err: Error = ControlError::UnknownCluster("x".to_string()).into();
        assert!(!err.is_bucket_not_found());
        assert!(!err.is_io());
    }

    #[test]
    fn io_errors_are_io() {
        let err: Error = std::io::Error::other("boom").into();
        assert!(err.is_io());
    }
}
