//! Event log error types.

use thiserror::Error;

/// Event log operation errors.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// SQLite backend failure.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to connect to Postgres.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Postgres query failure.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// The offset is already recorded for this session.
    #[error("offset {offset} already recorded for session {session_id}")]
    OffsetConflict { session_id: String, offset: u64 },

    /// The offset does not fit the storage column.
    #[error("offset {0} is out of range")]
    OffsetOutOfRange(u64),

    /// A stored row could not be decoded.
    #[error("invalid event row: {0}")]
    InvalidRow(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The blocking worker running a SQLite call failed.
    #[error("event log task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<weft_events::EventError> for EventLogError {
    fn from(err: weft_events::EventError) -> Self {
        EventLogError::InvalidRow(err.to_string())
    }
}
