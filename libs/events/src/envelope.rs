//! Event envelope - a stream event stamped with its session offset.

use serde::{Deserialize, Serialize};

use crate::{EventError, StreamEvent};

/// A [`StreamEvent`] together with the session-scoped offset it was assigned.
///
/// On the wire the offset sits next to the event's own fields:
/// `{"type":"html","html":"...","offset":4}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic, session-scoped offset starting at 0.
    pub offset: u64,

    /// The event payload.
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl EventEnvelope {
    pub fn new(offset: u64, event: StreamEvent) -> Self {
        Self { offset, event }
    }

    /// Serialize to the egress JSON form.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the egress JSON form.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }
}
