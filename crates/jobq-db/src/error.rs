//! Database error types.

use jobq_core::{JobId, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("duplicate: {0}")]
    Duplicate(JobId),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Duplicate(id) => StoreError::Duplicate(id),
            other => StoreError::Backend(other.to_string()),
        }
    }
}
