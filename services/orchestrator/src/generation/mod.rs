//! Generation contract.
//!
//! A [`Generator`] turns one batch of actions into stream events. The
//! processing loop owns retries: a retryable [`GenerationError`] re-runs the
//! whole batch, anything else abandons it.

mod echo;
mod line_protocol;
mod sink;

pub use echo::EchoGenerator;
pub use line_protocol::{LineProtocolGenerator, TokenRequest, TokenSource};
pub use sink::EventSink;

pub(crate) use sink::next_offset_after;

use async_trait::async_trait;
use thiserror::Error;
use weft_events::Action;
use weft_streaming::RetryExhausted;

use crate::event_log::EventLogError;
use crate::sandbox::{SandboxError, SandboxExecError, SandboxFailure, SandboxLease};

/// Input to one generation pass.
#[derive(Clone)]
pub struct GenerationRequest {
    pub session_id: String,
    /// Actions drained from the queue, in enqueue order.
    pub actions: Vec<Action>,
    /// Zero-based attempt index for this batch.
    pub attempt: u32,
    /// Lazily provisioned sandbox for this session.
    pub sandbox: SandboxLease,
}

impl GenerationRequest {
    /// The most recent UI snapshot any action in the batch carried.
    pub fn current_html(&self) -> Option<&str> {
        self.actions.iter().rev().find_map(Action::current_html)
    }
}

/// Generation errors.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The backend produced output that could not be parsed.
    #[error("malformed output ({reason}): {line}")]
    MalformedOutput { line: String, reason: String },

    #[error(transparent)]
    TokenStream(#[from] RetryExhausted),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    SandboxExec(#[from] SandboxExecError),

    #[error("failed to record event: {0}")]
    EventLog(#[from] EventLogError),
}

impl GenerationError {
    /// Whether re-running the batch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::MalformedOutput { .. })
    }
}

impl From<SandboxFailure> for GenerationError {
    fn from(err: SandboxFailure) -> Self {
        match err {
            SandboxFailure::Provision(e) => GenerationError::Sandbox(e),
            SandboxFailure::Exec(e) => GenerationError::SandboxExec(e),
        }
    }
}

/// Produces stream events for a batch of actions.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        sink: &mut EventSink,
    ) -> Result<(), GenerationError>;
}
