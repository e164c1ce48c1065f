//! Action and stream event definitions.
//!
//! Both types are closed tagged unions discriminated by a literal `type` field
//! on the wire. Field names are camelCase on the wire to match the transport
//! contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const SESSION: &str = "session";
    pub const PATCH: &str = "patch";
    pub const HTML: &str = "html";
    pub const STATS: &str = "stats";
    pub const DONE: &str = "done";
}

// =============================================================================
// Actions (ingress)
// =============================================================================

/// A single user command destined for a session actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Action {
    /// Free-text prompt. May carry the interaction that triggered it.
    #[serde(rename = "prompt")]
    Prompt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        action_data: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_html: Option<String>,
    },

    /// A named UI interaction (button press, form submit, ...).
    #[serde(rename = "action")]
    Interaction {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        action_data: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_html: Option<String>,
    },
}

impl Action {
    /// Build a prompt action.
    pub fn prompt(text: impl Into<String>) -> Self {
        Action::Prompt {
            prompt: Some(text.into()),
            action: None,
            action_data: Map::new(),
            current_html: None,
        }
    }

    /// Build a named interaction with its data.
    pub fn interaction(name: impl Into<String>, data: Map<String, Value>) -> Self {
        Action::Interaction {
            action: Some(name.into()),
            action_data: data,
            prompt: None,
            current_html: None,
        }
    }

    /// Attach the client's current UI snapshot.
    pub fn with_current_html(mut self, html: impl Into<String>) -> Self {
        match &mut self {
            Action::Prompt { current_html, .. } | Action::Interaction { current_html, .. } => {
                *current_html = Some(html.into());
            }
        }
        self
    }

    /// Free-text prompt, if any.
    pub fn prompt_text(&self) -> Option<&str> {
        match self {
            Action::Prompt { prompt, .. } | Action::Interaction { prompt, .. } => {
                prompt.as_deref()
            }
        }
    }

    /// Interaction name, if any.
    pub fn action_name(&self) -> Option<&str> {
        match self {
            Action::Prompt { action, .. } | Action::Interaction { action, .. } => {
                action.as_deref()
            }
        }
    }

    /// Interaction payload; empty when none was sent.
    pub fn action_data(&self) -> &Map<String, Value> {
        match self {
            Action::Prompt { action_data, .. } | Action::Interaction { action_data, .. } => {
                action_data
            }
        }
    }

    /// Current UI snapshot, if any.
    pub fn current_html(&self) -> Option<&str> {
        match self {
            Action::Prompt { current_html, .. } | Action::Interaction { current_html, .. } => {
                current_html.as_deref()
            }
        }
    }

    /// Wire discriminator (`prompt` or `action`).
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Prompt { .. } => "prompt",
            Action::Interaction { .. } => "action",
        }
    }
}

// =============================================================================
// Stream Events (egress)
// =============================================================================

/// How the last generation pass rendered its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Incremental DOM patches against the current UI.
    Patches,
    /// A full HTML document.
    Full,
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderMode::Patches => write!(f, "patches"),
            RenderMode::Full => write!(f, "full"),
        }
    }
}

impl FromStr for RenderMode {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patches" => Ok(RenderMode::Patches),
            "full" => Ok(RenderMode::Full),
            other => Err(EventError::UnknownRenderMode(other.to_string())),
        }
    }
}

/// Generation statistics reported after each pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub cache_rate: f64,
    pub tokens_per_second: f64,
    pub mode: RenderMode,
    pub patch_count: u32,
}

/// A UI update produced for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    /// Announces the session a stream belongs to.
    Session { session_id: String },
    /// An opaque DOM patch.
    Patch { patch: Value },
    /// A full HTML render.
    Html { html: String },
    /// Statistics for the pass that just completed.
    Stats(Stats),
    /// Terminal event of a pass, carrying the final HTML.
    Done { html: String },
}

impl StreamEvent {
    /// The discriminator for this event.
    pub fn event_type(&self) -> EventType {
        match self {
            StreamEvent::Session { .. } => EventType::Session,
            StreamEvent::Patch { .. } => EventType::Patch,
            StreamEvent::Html { .. } => EventType::Html,
            StreamEvent::Stats(_) => EventType::Stats,
            StreamEvent::Done { .. } => EventType::Done,
        }
    }

    /// Rendered HTML for terminal rendering events.
    pub fn html(&self) -> Option<&str> {
        match self {
            StreamEvent::Html { html } | StreamEvent::Done { html } => Some(html),
            _ => None,
        }
    }
}

/// Discriminator of a [`StreamEvent`], persisted alongside each log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Session,
    Patch,
    Html,
    Stats,
    Done,
}

impl EventType {
    /// Event types that carry a complete rendering of the UI.
    pub const TERMINAL_RENDER: [EventType; 2] = [EventType::Done, EventType::Html];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Session => event_types::SESSION,
            EventType::Patch => event_types::PATCH,
            EventType::Html => event_types::HTML,
            EventType::Stats => event_types::STATS,
            EventType::Done => event_types::DONE,
        }
    }

    /// Whether rows of this type can reconstruct the UI on their own.
    pub fn is_terminal_render(&self) -> bool {
        matches!(self, EventType::Done | EventType::Html)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            event_types::SESSION => Ok(EventType::Session),
            event_types::PATCH => Ok(EventType::Patch),
            event_types::HTML => Ok(EventType::Html),
            event_types::STATS => Ok(EventType::Stats),
            event_types::DONE => Ok(EventType::Done),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
