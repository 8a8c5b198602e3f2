//! Central error types for the machine-api operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Central error type for the machine-api operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Finalizer-related error during cleanup
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Configuration error (unparseable field, bad flag value)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Spec validation error; the object stays degraded until edited
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// State confirmation polling expired before the cache converged
    #[error("Timed out waiting for desired state: {0}")]
    PollTimeout(String),

    /// One or more sub-operations of a reconcile pass failed
    #[error("Reconciliation failed: {0}")]
    ReconcileError(String),
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Check if this error type should trigger a short retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::FinalizerError(_)
                | Error::PollTimeout(_)
                | Error::ReconcileError(_)
        )
    }
}

// Implement From for kube::runtime::finalizer::Error to enable ? operator
impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(e.to_string())
    }
}
