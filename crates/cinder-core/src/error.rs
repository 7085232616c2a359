//! Error types for Cinder CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Pipeline text is malformed. Fatal to the trigger, never retried.
    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    /// Pipeline violates the repository's trust policy.
    #[error("Pipeline rejected by policy: {0}")]
    Policy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A store write failed. Callers on the agent path absorb this and retry out-of-band.
    #[error("Store error: {0}")]
    TransientStore(String),

    #[error("Lease expired for task {0}")]
    QueueTimeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("{} {}", kind, id))
    }

    /// True for failures that must not fail an agent acknowledgement.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStore(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
