use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument};

use super::{guarded_tick, JobError};
use crate::event_log::EventLog;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Periodically deletes event rows older than the log's retention window.
pub struct EventCleanupWorker {
    event_log: Arc<dyn EventLog>,
    config: CleanupConfig,
}

impl EventCleanupWorker {
    pub fn new(event_log: Arc<dyn EventLog>, config: CleanupConfig) -> Self {
        Self { event_log, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting event cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    guarded_tick("event_cleanup", self.run_cleanup()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One cleanup pass. Returns the number of rows deleted.
    pub async fn run_cleanup(&self) -> Result<u64, JobError> {
        let deleted = self.event_log.cleanup().await?;
        if deleted > 0 {
            info!(deleted, "Cleaned up expired session events");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventLogError, EventLogRow};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use weft_events::StreamEvent;

    /// Fails every other cleanup call.
    #[derive(Default)]
    struct FlakyLog {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventLog for FlakyLog {
        async fn append(&self, _: &str, _: u64, _: &StreamEvent) -> Result<(), EventLogError> {
            Ok(())
        }

        async fn read_from(
            &self,
            _: &str,
            _: Option<u64>,
        ) -> Result<Vec<EventLogRow>, EventLogError> {
            Ok(Vec::new())
        }

        async fn latest_offset(&self, _: &str) -> Result<Option<u64>, EventLogError> {
            Ok(None)
        }

        async fn last_html_event(&self, _: &str) -> Result<Option<EventLogRow>, EventLogError> {
            Ok(None)
        }

        async fn cleanup(&self) -> Result<u64, EventLogError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call % 2 == 0 {
                Err(EventLogError::InvalidRow("disk on fire".into()))
            } else {
                Ok(2)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_survives_failed_ticks() {
        let log = Arc::new(FlakyLog::default());
        let worker = Arc::new(EventCleanupWorker::new(
            log.clone(),
            CleanupConfig {
                interval: Duration::from_secs(60),
            },
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_secs(60 * 4 + 1)).await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 4);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_cleanup_reports_count() {
        let log = Arc::new(FlakyLog::default());
        let worker = EventCleanupWorker::new(log, CleanupConfig::default());

        assert!(worker.run_cleanup().await.is_err());
        assert_eq!(worker.run_cleanup().await.unwrap(), 2);
    }
}
