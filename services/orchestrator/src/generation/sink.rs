//! Offset-stamping event sink.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;
use weft_events::{EventEnvelope, StreamEvent};

use crate::event_log::{EventLog, EventLogError};

/// Where a session's generated events go.
///
/// Each event is appended to the durable log at the next offset and only then
/// published to live subscribers, so a subscriber can never observe an offset
/// the log does not have.
pub struct EventSink {
    session_id: String,
    next_offset: u64,
    event_log: Arc<dyn EventLog>,
    events: broadcast::Sender<EventEnvelope>,
}

impl EventSink {
    pub fn new(
        session_id: impl Into<String>,
        next_offset: u64,
        event_log: Arc<dyn EventLog>,
        events: broadcast::Sender<EventEnvelope>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            next_offset,
            event_log,
            events,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Offset the next emitted event will receive.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Persist and publish one event. Returns its offset.
    ///
    /// If the offset was taken by a writer this sink did not know about, the
    /// counter is realigned with the log and the append retried once.
    pub async fn emit(&mut self, event: StreamEvent) -> Result<u64, EventLogError> {
        let mut offset = self.next_offset;
        match self.event_log.append(&self.session_id, offset, &event).await {
            Ok(()) => {}
            Err(EventLogError::OffsetConflict { .. }) => {
                offset = self.resync().await?;
                debug!(session_id = %self.session_id, offset, "Offset taken; resynced");
                self.event_log.append(&self.session_id, offset, &event).await?;
            }
            Err(e) => return Err(e),
        }
        self.next_offset = offset + 1;

        // No live subscribers is fine; the log has it.
        let _ = self.events.send(EventEnvelope::new(offset, event));
        Ok(offset)
    }

    /// Realign the offset counter with the log after a failed append.
    pub async fn resync(&mut self) -> Result<u64, EventLogError> {
        let latest = self.event_log.latest_offset(&self.session_id).await?;
        self.next_offset = next_offset_after(latest);
        Ok(self.next_offset)
    }
}

/// First free offset given the highest recorded one.
pub(crate) fn next_offset_after(latest: Option<u64>) -> u64 {
    latest.map_or(0, |offset| offset + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::SqliteEventLog;
    use std::time::Duration;

    fn html(text: &str) -> StreamEvent {
        StreamEvent::Html {
            html: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_emit_appends_then_publishes() {
        let log: Arc<dyn EventLog> =
            Arc::new(SqliteEventLog::open_in_memory(Duration::from_secs(600)).unwrap());
        let (tx, mut rx) = broadcast::channel(8);
        let mut sink = EventSink::new("s1", 0, Arc::clone(&log), tx);

        assert_eq!(sink.emit(html("a")).await.unwrap(), 0);
        assert_eq!(sink.emit(html("b")).await.unwrap(), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(log.latest_offset("s1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_emit_skips_offset_taken_by_stale_writer() {
        let log: Arc<dyn EventLog> =
            Arc::new(SqliteEventLog::open_in_memory(Duration::from_secs(600)).unwrap());
        let (tx, mut rx) = broadcast::channel(8);
        let mut sink = EventSink::new("s1", 0, Arc::clone(&log), tx);

        assert_eq!(sink.emit(html("a")).await.unwrap(), 0);
        // A closed predecessor's in-flight write lands late.
        log.append("s1", 1, &html("late")).await.unwrap();

        assert_eq!(sink.emit(html("b")).await.unwrap(), 2);
        assert_eq!(sink.next_offset(), 3);

        assert_eq!(rx.recv().await.unwrap().offset, 0);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.offset, 2);
        assert_eq!(second.event, html("b"));
    }

    #[tokio::test]
    async fn test_resync_after_external_writes() {
        let log: Arc<dyn EventLog> =
            Arc::new(SqliteEventLog::open_in_memory(Duration::from_secs(600)).unwrap());
        let (tx, _rx) = broadcast::channel(8);
        let mut sink = EventSink::new("s1", 0, Arc::clone(&log), tx);

        for offset in 0..3 {
            log.append("s1", offset, &html("existing")).await.unwrap();
        }
        assert_eq!(sink.resync().await.unwrap(), 3);
        assert_eq!(sink.emit(html("ok")).await.unwrap(), 3);
    }

    #[test]
    fn test_next_offset_after() {
        assert_eq!(next_offset_after(None), 0);
        assert_eq!(next_offset_after(Some(4)), 5);
    }
}
