//! Processor registry.
//!
//! Owns every live [`SessionActor`]. All structural changes to the map go
//! through [`ProcessorRegistry::get_or_create`] or
//! [`ProcessorRegistry::release`], both under the creation permit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;
use weft_events::EventEnvelope;

use super::SessionActor;
use crate::event_log::EventLog;
use crate::generation::Generator;
use crate::resume::{resume_stream, ResumeError};
use crate::sandbox::SandboxManager;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum actions drained into one generation batch.
    pub max_batch_actions: usize,
    /// Per-session live event buffer; slower subscribers lag and re-read the log.
    pub event_channel_capacity: usize,
    /// Attempts per batch for retryable generation errors.
    pub generation_attempts: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_batch_actions: 10,
            event_channel_capacity: 256,
            generation_attempts: 2,
        }
    }
}

/// Collaborators shared by every actor.
#[derive(Clone)]
pub(crate) struct ActorDeps {
    pub event_log: Arc<dyn EventLog>,
    pub sandboxes: Arc<SandboxManager>,
    pub generator: Arc<dyn Generator>,
    pub config: RegistryConfig,
}

/// Map of live session actors.
pub struct ProcessorRegistry {
    actors: RwLock<HashMap<String, Arc<SessionActor>>>,
    create_permit: Mutex<()>,
    deps: ActorDeps,
    actors_created: AtomicU64,
}

impl ProcessorRegistry {
    pub fn new(
        event_log: Arc<dyn EventLog>,
        sandboxes: Arc<SandboxManager>,
        generator: Arc<dyn Generator>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            actors: RwLock::new(HashMap::new()),
            create_permit: Mutex::new(()),
            deps: ActorDeps {
                event_log,
                sandboxes,
                generator,
                config,
            },
            actors_created: AtomicU64::new(0),
        }
    }

    /// Return the session's actor, creating it on first use.
    ///
    /// An existing actor has its activity bumped. Creation is serialized
    /// process-wide, so concurrent callers never build two actors for one
    /// session.
    pub async fn get_or_create(&self, session_id: &str) -> Arc<SessionActor> {
        if let Some(actor) = self.get(session_id) {
            actor.touch();
            return actor;
        }

        let _permit = self.create_permit.lock().await;

        // Another caller may have created it while we waited.
        if let Some(actor) = self.get(session_id) {
            actor.touch();
            return actor;
        }

        let actor = SessionActor::spawn(session_id, &self.deps);
        self.write().insert(session_id.to_string(), Arc::clone(&actor));
        let created = self.actors_created.fetch_add(1, Ordering::SeqCst) + 1;

        info!(session_id = %session_id, actors_created = created, "Session actor spawned");
        actor
    }

    /// Live actor for the session, without counting as activity.
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionActor>> {
        self.read().get(session_id).cloned()
    }

    /// Bump activity if the session is live.
    pub fn touch(&self, session_id: &str) {
        if let Some(actor) = self.read().get(session_id) {
            actor.touch();
        }
    }

    /// Remove and close the session's actor. Returns `false` if it was not live.
    ///
    /// Holds the creation permit until the actor is closed, so a replacement
    /// for the same session only starts once the old one has stopped.
    pub async fn release(&self, session_id: &str) -> bool {
        if self.get(session_id).is_none() {
            return false;
        }

        let _permit = self.create_permit.lock().await;
        let removed = self.write().remove(session_id);
        let Some(actor) = removed else {
            return false;
        };

        actor.close().await;
        info!(session_id = %session_id, "Session actor released");
        true
    }

    /// Release every live actor.
    pub async fn release_all(&self) {
        for session_id in self.session_ids() {
            self.release(&session_id).await;
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn last_activity(&self, session_id: &str) -> Option<Instant> {
        self.read().get(session_id).map(|actor| actor.last_activity())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Total actors constructed since startup.
    pub fn actors_created(&self) -> u64 {
        self.actors_created.load(Ordering::SeqCst)
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.deps.event_log
    }

    /// Events after `from_offset`, replayed from the log and then followed live.
    pub async fn subscribe_from(
        &self,
        session_id: &str,
        from_offset: Option<u64>,
    ) -> BoxStream<'static, Result<EventEnvelope, ResumeError>> {
        let actor = self.get_or_create(session_id).await;
        resume_stream(
            Arc::clone(&self.deps.event_log),
            session_id.to_string(),
            actor.subscribe(),
            from_offset,
        )
        .boxed()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<SessionActor>>> {
        self.actors.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<SessionActor>>> {
        self.actors.write().unwrap_or_else(PoisonError::into_inner)
    }
}
