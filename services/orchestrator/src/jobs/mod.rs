//! Background jobs.
//!
//! - [`DormancyChecker`]: releases actors idle past the timeout
//! - [`EventCleanupWorker`]: prunes event rows past retention
//!
//! Both run until their shutdown channel flips to `true`. A failing or
//! panicking tick is logged and the next tick runs as scheduled.

mod cleanup;
mod dormancy;

pub use cleanup::{CleanupConfig, EventCleanupWorker};
pub use dormancy::{DormancyChecker, DormancyConfig};

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use thiserror::Error;
use tracing::error;

use crate::event_log::EventLogError;

/// Errors from a single job tick.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    EventLog(#[from] EventLogError),
}

/// Run one tick, containing failures and panics.
pub(crate) async fn guarded_tick<F, T>(job: &'static str, tick: F) -> Option<T>
where
    F: Future<Output = Result<T, JobError>>,
{
    match AssertUnwindSafe(tick).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!(job, error = %e, "Job tick failed");
            None
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(job, panic = %message, "Job tick panicked");
            None
        }
    }
}
