//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for buildplane_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => buildplane_core::Error::NotFound(msg),
            other => buildplane_core::Error::Internal(other.to_string()),
        }
    }
}
