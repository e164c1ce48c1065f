//! Sandbox error types.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Provider-level failure. Fatal to the operation that requested it, never to
/// the session actor.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SandboxError {
    pub message: String,
    #[source]
    pub cause: Option<BoxError>,
}

impl SandboxError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }
}

/// Code execution failed inside a live sandbox.
#[derive(Debug, Clone, Error)]
#[error("sandbox execution failed: {message}")]
pub struct SandboxExecError {
    pub message: String,
    /// Output captured before the failure.
    pub output: String,
}

/// Either failure mode of running code in a lazily provisioned sandbox.
#[derive(Debug, Error)]
pub enum SandboxFailure {
    #[error(transparent)]
    Provision(#[from] SandboxError),

    #[error(transparent)]
    Exec(#[from] SandboxExecError),
}
