//! Error types for the metabase

use tessera_core::{CoreError, SegmentId};
use thiserror::Error;

/// Result type alias for metabase operations
pub type Result<T> = std::result::Result<T, MetabaseError>;

/// Metabase error types
#[derive(Error, Debug)]
pub enum MetabaseError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// The store cannot be reached at all; callers treat this as fatal
    #[error("Metabase unavailable: {0}")]
    Unavailable(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Segment not found: {0}")]
    SegmentNotFound(SegmentId),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Compare-and-swap lost: the stored pieces differ from the expected set
    #[error("Segment {0} pieces changed concurrently")]
    Conflict(SegmentId),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Invalid data: {0}")]
    Invalid(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl MetabaseError {
    /// Whether the error should stop the calling process
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Migration(_))
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Conflict(_))
    }
}

impl From<sqlx::Error> for MetabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_) => MetabaseError::Unavailable(err.to_string()),
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => {
                MetabaseError::Duplicate(db.message().to_string())
            }
            other => MetabaseError::Database(other),
        }
    }
}
