//! Dormancy checker.
//!
//! Releases session actors whose idle time strictly exceeds the timeout.
//! Released sessions keep their event log; the next `get_or_create` builds a
//! fresh actor that continues from the latest offset.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::{guarded_tick, JobError};
use crate::actors::ProcessorRegistry;

#[derive(Debug, Clone)]
pub struct DormancyConfig {
    /// Time between checks.
    pub interval: Duration,
    /// Idle time after which an actor is released.
    pub timeout: Duration,
}

impl Default for DormancyConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct DormancyChecker {
    registry: Arc<ProcessorRegistry>,
    config: DormancyConfig,
}

impl DormancyChecker {
    pub fn new(registry: Arc<ProcessorRegistry>, config: DormancyConfig) -> Self {
        Self { registry, config }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "Starting dormancy checker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    guarded_tick("dormancy", self.check_once()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Dormancy checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every live session. Returns how many were released.
    pub async fn check_once(&self) -> Result<usize, JobError> {
        let now = Instant::now();
        let mut released = 0;

        for session_id in self.registry.session_ids() {
            // Released since the listing.
            let Some(last_activity) = self.registry.last_activity(&session_id) else {
                continue;
            };

            let idle = now.saturating_duration_since(last_activity);
            if idle > self.config.timeout && self.registry.release(&session_id).await {
                info!(
                    session_id = %session_id,
                    idle_secs = idle.as_secs(),
                    "Released dormant session"
                );
                released += 1;
            }
        }

        debug!(released, live = self.registry.len(), "Dormancy check complete");
        Ok(released)
    }
}
