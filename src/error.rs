//! Error types for the DocumentDB operator
//!
//! Errors carry their own retry classification so the controller's error
//! policy can pick between a short cool-down and a long one.

use std::time::Duration;

use thiserror::Error;

/// Requeue delay for transient failures (API conflicts, unpublished tokens).
pub const TRANSIENT_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue delay for configuration errors that only a spec change can fix.
pub const CONFIG_REQUEUE: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// `replica.self` of an existing engine cluster may never change.
    #[error("Immutable field changed: {field} ({current} -> {desired})")]
    ImmutableField {
        field: String,
        current: String,
        desired: String,
    },

    /// The local member identity is required but could not be resolved.
    #[error("Local member identity unavailable: {0}")]
    MissingIdentity(String),

    /// The demotion token of the outgoing primary is not readable yet.
    #[error("Promotion token not available from {source_name}: {reason}")]
    TokenUnavailable { source_name: String, reason: String },

    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

impl Error {
    /// Configuration errors never resolve by retrying; they need a spec change.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::ConfigError(_)
                | Error::ValidationError(_)
                | Error::ImmutableField { .. }
                | Error::MissingIdentity(_)
        )
    }

    /// Check if this error should be retried on a short cycle
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => {
                e.code == 409 || e.code == 429 || e.code >= 500
            }
            Error::KubeError(_) | Error::HttpError(_) | Error::TokenUnavailable { .. } => true,
            Error::FinalizerError(_) => true,
            Error::SerializationError(_) => false,
            _ => !self.is_config_error(),
        }
    }

    /// Recommended requeue delay for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_config_error() {
            CONFIG_REQUEUE
        } else {
            TRANSIENT_REQUEUE
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        match err {
            kube::runtime::finalizer::Error::ApplyFailed(e)
            | kube::runtime::finalizer::Error::CleanupFailed(e) => e,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
