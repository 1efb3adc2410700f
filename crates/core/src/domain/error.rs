// Domain Error Types

use thiserror::Error;

use super::job::JobId;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid job state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Unknown job group: {0}")]
    UnknownJobGroup(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
