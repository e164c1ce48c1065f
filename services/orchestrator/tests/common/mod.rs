#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use weft_events::EventEnvelope;
use weft_orchestrator::{
    actors::{ProcessorRegistry, RegistryConfig},
    event_log::{EventLog, SqliteEventLog},
    generation::{EchoGenerator, Generator},
    sandbox::{InMemorySandboxProvider, SandboxConfig, SandboxInitMode, SandboxManager},
};

pub struct Harness {
    pub registry: Arc<ProcessorRegistry>,
    pub provider: Arc<InMemorySandboxProvider>,
    pub event_log: Arc<dyn EventLog>,
}

pub struct HarnessBuilder {
    generator: Arc<dyn Generator>,
    sandbox: SandboxConfig,
    registry: RegistryConfig,
    provider: InMemorySandboxProvider,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            generator: Arc::new(EchoGenerator::new()),
            sandbox: SandboxConfig::default(),
            registry: RegistryConfig::default(),
            provider: InMemorySandboxProvider::new(),
        }
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn lazy_sandboxes(mut self) -> Self {
        self.sandbox.init_mode = SandboxInitMode::Lazy;
        self
    }

    pub fn registry_config(mut self, config: RegistryConfig) -> Self {
        self.registry = config;
        self
    }

    pub fn provider(mut self, provider: InMemorySandboxProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn build(self) -> Harness {
        let event_log: Arc<dyn EventLog> =
            Arc::new(SqliteEventLog::open_in_memory(Duration::from_secs(600)).unwrap());
        let provider = Arc::new(self.provider);
        let sandboxes = Arc::new(SandboxManager::new(provider.clone(), self.sandbox));
        let registry = Arc::new(ProcessorRegistry::new(
            Arc::clone(&event_log),
            sandboxes,
            self.generator,
            self.registry,
        ));

        Harness {
            registry,
            provider,
            event_log,
        }
    }
}

impl Harness {
    /// Collect `n` events for the session after `from_offset`, failing after 5s.
    pub async fn collect_events(
        &self,
        session_id: &str,
        from_offset: Option<u64>,
        n: usize,
    ) -> Vec<EventEnvelope> {
        let stream = self.registry.subscribe_from(session_id, from_offset).await;
        tokio::time::timeout(
            Duration::from_secs(5),
            stream.take(n).map(|e| e.unwrap()).collect::<Vec<_>>(),
        )
        .await
        .expect("timed out waiting for events")
    }
}

/// Poll `condition` until it holds, failing after 5s.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
