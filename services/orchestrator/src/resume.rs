//! Resumable event streams.
//!
//! A reconnecting subscriber passes the last offset it saw. The stream
//! replays everything after it from the log, then follows the live channel.
//! The live receiver must be created before the log is read, so nothing
//! published in between is lost; events seen on both paths are dropped by
//! offset. A subscriber that lags behind the channel re-reads the gap from
//! the log.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use weft_events::EventEnvelope;

use crate::event_log::{EventLog, EventLogError};

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("failed to replay events: {0}")]
    EventLog(#[from] EventLogError),
}

struct ResumeState {
    event_log: Arc<dyn EventLog>,
    session_id: String,
    live: BroadcastStream<EventEnvelope>,
    backlog: VecDeque<EventEnvelope>,
    last_delivered: Option<u64>,
    needs_replay: bool,
    failed: bool,
}

impl ResumeState {
    fn is_new(&self, offset: u64) -> bool {
        self.last_delivered.map_or(true, |last| offset > last)
    }
}

/// Gap-free, strictly ascending events after `from_offset`.
///
/// `live` must have been subscribed before this is called. The stream ends
/// when the live channel closes, or after yielding a replay error.
pub fn resume_stream(
    event_log: Arc<dyn EventLog>,
    session_id: String,
    live: broadcast::Receiver<EventEnvelope>,
    from_offset: Option<u64>,
) -> impl Stream<Item = Result<EventEnvelope, ResumeError>> + Send + 'static {
    let state = ResumeState {
        event_log,
        session_id,
        live: BroadcastStream::new(live),
        backlog: VecDeque::new(),
        last_delivered: from_offset,
        needs_replay: true,
        failed: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.failed {
                return None;
            }

            if state.needs_replay {
                state.needs_replay = false;
                match state
                    .event_log
                    .read_from(&state.session_id, state.last_delivered)
                    .await
                {
                    Ok(rows) => state.backlog.extend(rows.iter().map(|row| row.envelope())),
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(e.into()), state));
                    }
                }
            }

            let next = match state.backlog.pop_front() {
                Some(envelope) => envelope,
                None => match state.live.next().await {
                    Some(Ok(envelope)) => envelope,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        debug!(
                            session_id = %state.session_id,
                            skipped,
                            "Subscriber lagged; replaying from log"
                        );
                        state.needs_replay = true;
                        continue;
                    }
                    None => return None,
                },
            };

            if state.is_new(next.offset) {
                state.last_delivered = Some(next.offset);
                return Some((Ok(next), state));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::SqliteEventLog;
    use std::time::Duration;
    use weft_events::StreamEvent;

    fn html(n: u64) -> StreamEvent {
        StreamEvent::Html {
            html: format!("<p>{n}</p>"),
        }
    }

    async fn log_with(count: u64) -> Arc<dyn EventLog> {
        let log = SqliteEventLog::open_in_memory(Duration::from_secs(600)).unwrap();
        for offset in 0..count {
            log.append("s1", offset, &html(offset)).await.unwrap();
        }
        Arc::new(log)
    }

    async fn offsets<S>(stream: S, n: usize) -> Vec<u64>
    where
        S: Stream<Item = Result<EventEnvelope, ResumeError>>,
    {
        stream
            .take(n)
            .map(|item| item.unwrap().offset)
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_replay_then_live_without_duplicates() {
        let log = log_with(3).await;
        let (tx, rx) = broadcast::channel(16);

        // Offset 2 is in the log and also still in flight on the channel;
        // offset 3 is only live.
        tx.send(EventEnvelope::new(2, html(2))).unwrap();
        tx.send(EventEnvelope::new(3, html(3))).unwrap();

        let stream = resume_stream(log, "s1".into(), rx, Some(0));
        assert_eq!(offsets(stream, 3).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_from_start() {
        let log = log_with(2).await;
        let (tx, rx) = broadcast::channel(16);
        drop(tx);

        let all: Vec<_> = resume_stream(log, "s1".into(), rx, None).collect().await;
        let offsets: Vec<u64> = all.into_iter().map(|r| r.unwrap().offset).collect();
        assert_eq!(offsets, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_lag_rereads_gap_from_log() {
        let log = log_with(1).await;
        let (tx, rx) = broadcast::channel(2);
        tx.send(EventEnvelope::new(0, html(0))).unwrap();

        let mut stream = Box::pin(resume_stream(Arc::clone(&log), "s1".into(), rx, None));
        assert_eq!(stream.next().await.unwrap().unwrap().offset, 0);

        // Overflow the channel while the subscriber is idle.
        for offset in 1..6 {
            log.append("s1", offset, &html(offset)).await.unwrap();
            tx.send(EventEnvelope::new(offset, html(offset))).unwrap();
        }

        assert_eq!(offsets(stream, 5).await, vec![1, 2, 3, 4, 5]);
    }
}
