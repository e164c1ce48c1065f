//! Postgres-backed event log.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use weft_events::{EventType, StreamEvent};

use super::{
    cutoff_millis, db_offset, now_millis, read_after, EventLog, EventLogConfig, EventLogError,
    EventLogRow,
};

/// Postgres event log.
#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
    retention: Duration,
}

impl PgEventLog {
    /// Create a connection pool.
    pub async fn connect(config: &EventLogConfig) -> Result<Self, EventLogError> {
        info!(
            max_connections = config.max_connections,
            "Connecting to event log database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(EventLogError::Connect)?;

        info!("Event log connection pool established");

        Ok(Self::from_pool(pool, config.retention))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, retention: Duration) -> Self {
        Self { pool, retention }
    }

    /// Run pending migrations from the first migrations directory found.
    pub async fn run_migrations(&self) -> Result<(), EventLogError> {
        info!("Running event log migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/orchestrator/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await?;
                    info!("Event log migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(EventLogError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Delete rows created strictly before `cutoff_ms`.
    pub async fn delete_before(&self, cutoff_ms: i64) -> Result<u64, EventLogError> {
        let result = sqlx::query("DELETE FROM session_events WHERE created_at < $1")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .map_err(EventLogError::Query)?;

        Ok(result.rows_affected())
    }
}

fn decode(row: &PgRow) -> Result<EventLogRow, EventLogError> {
    let session_id: String = row.try_get("session_id").map_err(EventLogError::Query)?;
    let offset: i64 = row.try_get("event_offset").map_err(EventLogError::Query)?;
    let event_type: String = row.try_get("event_type").map_err(EventLogError::Query)?;
    let data: serde_json::Value = row.try_get("data").map_err(EventLogError::Query)?;
    let created_at: i64 = row.try_get("created_at").map_err(EventLogError::Query)?;

    EventLogRow::decode(session_id, offset, &event_type, data, created_at)
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(
        &self,
        session_id: &str,
        offset: u64,
        event: &StreamEvent,
    ) -> Result<(), EventLogError> {
        let stored_offset = db_offset(offset)?;
        let data = serde_json::to_value(event)?;

        sqlx::query(
            r#"
            INSERT INTO session_events (session_id, event_offset, event_type, data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session_id)
        .bind(stored_offset)
        .bind(event.event_type().as_str())
        .bind(&data)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.code().as_deref() == Some("23505") {
                    return EventLogError::OffsetConflict {
                        session_id: session_id.to_string(),
                        offset,
                    };
                }
            }
            EventLogError::Query(e)
        })?;

        Ok(())
    }

    async fn read_from(
        &self,
        session_id: &str,
        from_offset: Option<u64>,
    ) -> Result<Vec<EventLogRow>, EventLogError> {
        let Some(after) = read_after(from_offset) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT session_id, event_offset, event_type, data, created_at
            FROM session_events
            WHERE session_id = $1 AND event_offset > $2
            ORDER BY event_offset ASC
            "#,
        )
        .bind(session_id)
        .bind(after)
        .fetch_all(&self.pool)
        .await
        .map_err(EventLogError::Query)?;

        rows.iter().map(decode).collect()
    }

    async fn latest_offset(&self, session_id: &str) -> Result<Option<u64>, EventLogError> {
        let row = sqlx::query(
            "SELECT MAX(event_offset) AS max_offset FROM session_events WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(EventLogError::Query)?;

        let max: Option<i64> = row.try_get("max_offset").map_err(EventLogError::Query)?;
        Ok(max.map(|o| o as u64))
    }

    async fn last_html_event(
        &self,
        session_id: &str,
    ) -> Result<Option<EventLogRow>, EventLogError> {
        let terminal: Vec<&str> = EventType::TERMINAL_RENDER
            .iter()
            .map(EventType::as_str)
            .collect();

        let row = sqlx::query(
            r#"
            SELECT session_id, event_offset, event_type, data, created_at
            FROM session_events
            WHERE session_id = $1 AND event_type = ANY($2)
            ORDER BY event_offset DESC
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .bind(&terminal)
        .fetch_optional(&self.pool)
        .await
        .map_err(EventLogError::Query)?;

        row.as_ref().map(decode).transpose()
    }

    async fn cleanup(&self) -> Result<u64, EventLogError> {
        self.delete_before(cutoff_millis(self.retention)).await
    }
}
