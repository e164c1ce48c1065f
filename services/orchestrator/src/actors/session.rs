//! Session actor.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};
use weft_events::{Action, EventEnvelope};

use super::processor::{run_processing_loop, ProcessorContext};
use super::registry::ActorDeps;
use super::{ActorError, Scope};
use crate::sandbox::SandboxRef;

/// A live session: action queue in, event broadcast out.
///
/// Owns one scope holding the warm-start task, the processing loop and the
/// finalizer that releases the session's sandbox.
pub struct SessionActor {
    session_id: String,
    actions: mpsc::UnboundedSender<Action>,
    events: broadcast::Sender<EventEnvelope>,
    last_activity: Mutex<Instant>,
    sandbox: SandboxRef,
    scope: Scope,
}

impl SessionActor {
    pub(crate) fn spawn(session_id: &str, deps: &ActorDeps) -> Arc<Self> {
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(deps.config.event_channel_capacity.max(1));
        let sandbox = SandboxRef::new();
        let scope = Scope::new(format!("session:{session_id}"));

        let manager = Arc::clone(&deps.sandboxes);
        let warm_ref = sandbox.clone();
        let id = session_id.to_string();
        scope.spawn("warm-start", async move {
            match manager.warm_start(&id, &warm_ref).await {
                Ok(Some(handle)) => {
                    debug!(
                        session_id = %id,
                        sandbox_id = %handle.sandbox_id,
                        "Sandbox warm-started"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Sandbox warm start failed");
                }
            }
        });

        scope.spawn(
            "processing-loop",
            run_processing_loop(ProcessorContext {
                session_id: session_id.to_string(),
                actions: actions_rx,
                events: events.clone(),
                sandbox: deps.sandboxes.lease(session_id, &sandbox),
                deps: deps.clone(),
            }),
        );

        let manager = Arc::clone(&deps.sandboxes);
        let release_ref = sandbox.clone();
        scope.add_finalizer(async move {
            manager.release_sandbox(&release_ref).await;
        });

        Arc::new(Self {
            session_id: session_id.to_string(),
            actions: actions_tx,
            events,
            last_activity: Mutex::new(Instant::now()),
            sandbox,
            scope,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue an action for processing. Counts as activity.
    pub fn enqueue(&self, action: Action) -> Result<(), ActorError> {
        if self.scope.is_closed() {
            return Err(ActorError::ActorStopped);
        }
        self.touch();
        self.actions
            .send(action)
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Live events from now on. Pair with the event log to catch up.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sandbox(&self) -> &SandboxRef {
        &self.sandbox
    }

    pub fn is_closed(&self) -> bool {
        self.scope.is_closed()
    }

    /// Cancel the actor's tasks and release its sandbox.
    pub(crate) async fn close(&self) {
        self.scope.close().await;
    }
}
