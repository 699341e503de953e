//! Queue engine errors.

use jobq_core::{JobId, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("duplicate job id: {0}")]
    DuplicateId(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
