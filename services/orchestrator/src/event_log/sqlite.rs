//! SQLite-backed event log.
//!
//! `rusqlite` is synchronous, so every call runs on the blocking pool while
//! holding the connection mutex.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;
use weft_events::{EventType, StreamEvent};

use super::{
    cutoff_millis, db_offset, now_millis, read_after, EventLog, EventLogError, EventLogRow,
};

const SELECT_COLUMNS: &str = "session_id, event_offset, event_type, data, created_at";

type RawRow = (String, i64, String, String, i64);

/// SQLite event log.
#[derive(Clone)]
pub struct SqliteEventLog {
    conn: Arc<Mutex<Connection>>,
    retention: Duration,
}

impl SqliteEventLog {
    /// Open or create an event log at the given path.
    pub fn open<P: AsRef<Path>>(path: P, retention: Duration) -> Result<Self, EventLogError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn, retention)
    }

    /// Open an in-memory event log.
    pub fn open_in_memory(retention: Duration) -> Result<Self, EventLogError> {
        Self::with_connection(Connection::open_in_memory()?, retention)
    }

    fn with_connection(conn: Connection, retention: Duration) -> Result<Self, EventLogError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retention,
        })
    }

    /// Delete rows created strictly before `cutoff_ms`.
    pub async fn delete_before(&self, cutoff_ms: i64) -> Result<u64, EventLogError> {
        self.call(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM session_events WHERE created_at < ?1",
                params![cutoff_ms],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn call<T, F>(&self, f: F) -> Result<T, EventLogError>
    where
        F: FnOnce(&Connection) -> Result<T, EventLogError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await?
    }
}

fn init_schema(conn: &Connection) -> Result<(), EventLogError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS session_events (
            session_id TEXT NOT NULL,
            event_offset INTEGER NOT NULL CHECK (event_offset >= 0),
            event_type TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, event_offset)
        );

        CREATE INDEX IF NOT EXISTS idx_session_events_created_at
            ON session_events(created_at);
        "#,
    )?;

    debug!("Event log schema initialized");
    Ok(())
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode(
    (session_id, offset, event_type, data, created_at): RawRow,
) -> Result<EventLogRow, EventLogError> {
    let data: serde_json::Value = serde_json::from_str(&data)?;
    EventLogRow::decode(session_id, offset, &event_type, data, created_at)
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(
        &self,
        session_id: &str,
        offset: u64,
        event: &StreamEvent,
    ) -> Result<(), EventLogError> {
        let session_id = session_id.to_string();
        let stored_offset = db_offset(offset)?;
        let event_type = event.event_type().as_str();
        let data = serde_json::to_string(event)?;
        let created_at = now_millis();

        self.call(move |conn| {
            let result = conn.execute(
                r#"
                INSERT INTO session_events (session_id, event_offset, event_type, data, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![session_id, stored_offset, event_type, data, created_at],
            );

            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(EventLogError::OffsetConflict { session_id, offset })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn read_from(
        &self,
        session_id: &str,
        from_offset: Option<u64>,
    ) -> Result<Vec<EventLogRow>, EventLogError> {
        let Some(after) = read_after(from_offset) else {
            return Ok(Vec::new());
        };
        let session_id = session_id.to_string();

        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM session_events
                 WHERE session_id = ?1 AND event_offset > ?2
                 ORDER BY event_offset ASC"
            ))?;

            let raw = stmt
                .query_map(params![session_id, after], read_raw)?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter().map(decode).collect()
        })
        .await
    }

    async fn latest_offset(&self, session_id: &str) -> Result<Option<u64>, EventLogError> {
        let session_id = session_id.to_string();

        self.call(move |conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(event_offset) FROM session_events WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            Ok(max.map(|o| o as u64))
        })
        .await
    }

    async fn last_html_event(
        &self,
        session_id: &str,
    ) -> Result<Option<EventLogRow>, EventLogError> {
        let session_id = session_id.to_string();
        let [first, second] = EventType::TERMINAL_RENDER;

        self.call(move |conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {SELECT_COLUMNS} FROM session_events
                         WHERE session_id = ?1 AND event_type IN (?2, ?3)
                         ORDER BY event_offset DESC
                         LIMIT 1"
                    ),
                    params![session_id, first.as_str(), second.as_str()],
                    read_raw,
                )
                .optional()?;

            raw.map(decode).transpose()
        })
        .await
    }

    async fn cleanup(&self) -> Result<u64, EventLogError> {
        self.delete_before(cutoff_millis(self.retention)).await
    }
}
