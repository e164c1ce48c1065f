//! # weft-events
//!
//! Wire types shared between the session orchestrator and the transport layer.
//!
//! ## Ingress
//!
//! An [`Action`] is one user command: either a free-text prompt or a named UI
//! action with opaque data. Actions are consumed once, in enqueue order, by the
//! session's processing loop.
//!
//! ## Egress
//!
//! A [`StreamEvent`] is one UI update produced by generation. Once assigned to a
//! session it is wrapped in an [`EventEnvelope`] carrying its session-scoped
//! offset. Offsets start at 0 and strictly increase; subscribers use them to
//! resume after a disconnect and to deduplicate at the replay/live boundary.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
