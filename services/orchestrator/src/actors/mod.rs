//! Session actors.
//!
//! Each live session is served by one [`SessionActor`]:
//! - an unbounded FIFO action queue
//! - a broadcast channel of offset-stamped events
//! - a processing loop that drains the queue through a generator
//! - a best-effort sandbox warm start
//!
//! Everything an actor spawns lives in its [`Scope`]; closing the scope stops
//! the tasks and releases the sandbox. [`ProcessorRegistry`] owns the actors.

mod processor;
mod registry;
mod scope;
mod session;

pub use registry::{ProcessorRegistry, RegistryConfig};
pub use scope::Scope;
pub use session::SessionActor;

use thiserror::Error;

/// Errors returned by actor handles.
#[derive(Debug, Error)]
pub enum ActorError {
    /// The actor was released.
    #[error("actor stopped")]
    ActorStopped,
}
