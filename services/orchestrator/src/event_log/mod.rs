//! Durable, offset-ordered event log.
//!
//! Every event a session actor publishes is first appended here with its
//! session-scoped offset. Reconnecting subscribers call
//! [`EventLog::read_from`] to catch up on offsets they missed before joining
//! the live broadcast, and [`EventLog::last_html_event`] reconstructs the UI
//! when no live actor exists. Rows outlive the actor that wrote them and are
//! removed only by time-based retention ([`EventLog::cleanup`]).
//!
//! Two backends share one schema (`session_events`):
//! - [`SqliteEventLog`]: embedded, single-node (default)
//! - [`PgEventLog`]: Postgres via SQLx

mod error;
mod postgres;
mod sqlite;

pub use error::EventLogError;
pub use postgres::PgEventLog;
pub use sqlite::SqliteEventLog;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use weft_events::{EventEnvelope, EventType, StreamEvent};

/// A persisted event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLogRow {
    pub session_id: String,
    pub offset: u64,
    pub event_type: EventType,
    pub event: StreamEvent,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
}

impl EventLogRow {
    /// The egress form of this row.
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope::new(self.offset, self.event.clone())
    }

    pub(crate) fn decode(
        session_id: String,
        offset: i64,
        event_type: &str,
        data: serde_json::Value,
        created_at: i64,
    ) -> Result<Self, EventLogError> {
        let offset = u64::try_from(offset)
            .map_err(|_| EventLogError::InvalidRow(format!("negative offset {offset}")))?;
        Ok(Self {
            session_id,
            offset,
            event_type: event_type.parse()?,
            event: serde_json::from_value(data)?,
            created_at,
        })
    }
}

/// Append/read/prune contract over session event rows.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist one event at the caller-assigned offset.
    ///
    /// Fails with [`EventLogError::OffsetConflict`] if the offset is taken.
    async fn append(
        &self,
        session_id: &str,
        offset: u64,
        event: &StreamEvent,
    ) -> Result<(), EventLogError>;

    /// All rows with offset strictly greater than `from_offset`, ascending.
    /// `None` reads from the beginning.
    async fn read_from(
        &self,
        session_id: &str,
        from_offset: Option<u64>,
    ) -> Result<Vec<EventLogRow>, EventLogError>;

    /// Highest recorded offset, or `None` when the session has no rows.
    async fn latest_offset(&self, session_id: &str) -> Result<Option<u64>, EventLogError>;

    /// Most recent `done` or `html` row.
    async fn last_html_event(&self, session_id: &str)
        -> Result<Option<EventLogRow>, EventLogError>;

    /// Delete rows older than the retention window. Returns the count deleted.
    async fn cleanup(&self) -> Result<u64, EventLogError>;
}

/// Event log configuration.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// `postgres://...` selects Postgres; `sqlite://path`, a bare path or
    /// `:memory:` selects SQLite.
    pub database_url: String,

    /// Maximum Postgres pool size.
    pub max_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Rows older than this are removed by [`EventLog::cleanup`].
    pub retention: Duration,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://weft-events.db".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            retention: Duration::from_secs(600),
        }
    }
}

/// Open the backend selected by `config.database_url`.
pub async fn connect(config: &EventLogConfig) -> Result<Arc<dyn EventLog>, EventLogError> {
    let url = config.database_url.as_str();

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let log = PgEventLog::connect(config).await?;
        log.run_migrations().await?;
        return Ok(Arc::new(log));
    }

    let path = url.strip_prefix("sqlite://").unwrap_or(url);
    let log = if path == ":memory:" {
        SqliteEventLog::open_in_memory(config.retention)?
    } else {
        SqliteEventLog::open(path, config.retention)?
    };
    info!(path = %path, "Opened SQLite event log");
    Ok(Arc::new(log))
}

/// Storage form of an offset.
pub(crate) fn db_offset(offset: u64) -> Result<i64, EventLogError> {
    i64::try_from(offset).map_err(|_| EventLogError::OffsetOutOfRange(offset))
}

/// Exclusive lower bound for `read_from`. `None` when no stored offset can
/// exceed `from_offset`.
pub(crate) fn read_after(from_offset: Option<u64>) -> Option<i64> {
    match from_offset {
        None => Some(-1),
        Some(offset) => i64::try_from(offset).ok(),
    }
}

/// Current time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Retention cutoff in epoch milliseconds.
pub(crate) fn cutoff_millis(retention: Duration) -> i64 {
    now_millis().saturating_sub(i64::try_from(retention.as_millis()).unwrap_or(i64::MAX))
}
