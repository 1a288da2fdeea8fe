//! Error types for the mesh control plane.

use thiserror::Error;

/// Errors raised by the control plane itself, before or around the
/// caller's operation. Failures of the wrapped operation are carried
/// separately by [`crate::retry::RetryError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Discovery found no eligible instance for the target.
    #[error("no healthy instance available for service '{service}' (version: {version})")]
    NoHealthyInstance { service: String, version: String },

    /// Request signing or signature verification failed.
    #[error("authentication failed for service '{service}': {reason}")]
    AuthenticationFailed { service: String, reason: String },

    /// An ACL entry denied the source/target pair.
    #[error("access denied: '{caller}' is not allowed to call '{target}'")]
    AccessDenied { caller: String, target: String },

    /// The target service's circuit breaker is open.
    #[error("circuit breaker is open for service '{service}'")]
    CircuitOpen { service: String },

    /// Invalid mesh configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, MeshError>;
