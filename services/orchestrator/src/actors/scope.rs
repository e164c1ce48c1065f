//! Ownership scopes.
//!
//! A scope owns a group of spawned tasks plus finalizers. Closing it aborts
//! every task, waits for them to stop, then runs the finalizers in reverse
//! registration order. Session actors own one scope; each managed sandbox
//! owns a child scope whose finalizer terminates it.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
struct ScopeState {
    closed: bool,
    tasks: Vec<(String, JoinHandle<()>)>,
    finalizers: Vec<BoxFuture<'static, ()>>,
}

/// Cancellable task group. Cloning shares the same scope.
#[derive(Clone)]
pub struct Scope {
    name: Arc<str>,
    state: Arc<Mutex<ScopeState>>,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(Mutex::new(ScopeState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn `future` into the scope.
    ///
    /// Returns `false` without spawning if the scope is already closed.
    pub fn spawn<F>(&self, task: &str, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock();
        if state.closed {
            debug!(scope = %self.name, task, "Refusing spawn into closed scope");
            return false;
        }
        state.tasks.push((task.to_string(), tokio::spawn(future)));
        true
    }

    /// Register a finalizer to run on close.
    ///
    /// Returns `false` and drops the finalizer if the scope is already closed.
    pub fn add_finalizer<F>(&self, finalizer: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.finalizers.push(finalizer.boxed());
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the scope. Only the first call does any work.
    ///
    /// Must not be awaited from one of the scope's own tasks.
    pub async fn close(&self) {
        let (tasks, finalizers) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.tasks),
                std::mem::take(&mut state.finalizers),
            )
        };

        for (_, handle) in &tasks {
            handle.abort();
        }
        for (task, handle) in tasks {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(scope = %self.name, task = %task, "Scoped task panicked");
                }
            }
        }

        for finalizer in finalizers.into_iter().rev() {
            finalizer.await;
        }

        debug!(scope = %self.name, "Scope closed");
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
