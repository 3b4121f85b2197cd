//! Error types for the operation engine.

use thiserror::Error;

use crate::provider::ProviderError;

/// Errors that can occur while building, running, or persisting operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("operation not found: {0}")]
    OperationNotFound(String),

    #[error("an operation for cluster '{cluster_id}' in {region} is already running or paused")]
    OperationAlreadyRunning { cluster_id: String, region: String },

    #[error("operation {0} is not paused")]
    OperationNotPaused(String),

    #[error("operation {0} is not running")]
    OperationNotRunning(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("blue/green deployment not found: {0}")]
    BlueGreenDeploymentNotFound(String),

    #[error("wait timed out: {0}")]
    WaitTimeout(String),

    #[error("step failed: {0}")]
    StepFailed(String),

    #[error("intervention required: {0}")]
    InterventionRequired(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("cannot delete operation {0} in its current state (use force)")]
    CannotDelete(String),

    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Provider not-found kinds surface as the matching engine error kind so
/// callers can match on a stable taxonomy regardless of which layer raised it.
impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::ClusterNotFound(id) => Error::ClusterNotFound(id),
            ProviderError::InstanceNotFound(id) => Error::InstanceNotFound(id),
            ProviderError::DeploymentNotFound(id) => Error::BlueGreenDeploymentNotFound(id),
            other => Error::Provider(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
