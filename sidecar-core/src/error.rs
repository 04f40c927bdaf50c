use sidecar_model::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// Failure reported by one of the job, slice or range accessors.
    #[error("Store error: {0}")]
    Store(String),

    /// The work cannot be accepted or completed and must not be retried
    /// as-is; the range is recorded as failed.
    #[error("Restore job fatal error: {0}")]
    RestoreJobFatal(String),

    #[error("Storage client error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Programming error, e.g. a task used before it was wired up.
    #[error("Contract violation: {0}")]
    ContractViolation(String),
}

impl SidecarError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SidecarError::RestoreJobFatal(_))
    }
}

pub type Result<T> = std::result::Result<T, SidecarError>;
