//! Record store error types.

use thiserror::Error;

use crate::JobId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate job id: {0}")]
    Duplicate(JobId),

    #[error("unsupported store operation: {0}")]
    Unsupported(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
