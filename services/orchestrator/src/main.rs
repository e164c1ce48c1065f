//! weft orchestrator
//!
//! Runs the session core with its background jobs. Commands arrive as JSON
//! lines on stdin (`{"sessionId":"s1","type":"prompt","prompt":"hi"}`) and
//! every session's events are written to stdout as JSON lines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use weft_events::{Action, EventEnvelope};
use weft_orchestrator::{
    actors::ProcessorRegistry,
    config,
    event_log,
    generation::EchoGenerator,
    jobs::{DormancyChecker, EventCleanupWorker},
    resume::ResumeError,
    sandbox::{InMemorySandboxProvider, SandboxManager, SandboxProvider},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Command {
    session_id: String,
    #[serde(flatten)]
    action: Action,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Output<'a> {
    session_id: &'a str,
    #[serde(flatten)]
    envelope: &'a EventEnvelope,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to WEFT_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!("Starting weft orchestrator");

    let event_log = match event_log::connect(&config.event_log).await {
        Ok(log) => log,
        Err(e) => {
            error!(error = %e, "Failed to open event log");
            return Err(e.into());
        }
    };

    let provider: Arc<dyn SandboxProvider> = match config.sandbox.provider.as_str() {
        "memory" => Arc::new(InMemorySandboxProvider::new()),
        other => bail!("unsupported sandbox provider: {other}"),
    };
    info!(
        provider = provider.id(),
        init_mode = %config.sandbox.init_mode,
        "Sandbox provider configured"
    );
    let sandboxes = Arc::new(SandboxManager::new(provider, config.sandbox.clone()));

    let registry = Arc::new(ProcessorRegistry::new(
        Arc::clone(&event_log),
        sandboxes,
        Arc::new(EchoGenerator::new()),
        config.registry.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dormancy = DormancyChecker::new(Arc::clone(&registry), config.dormancy.clone());
    let dormancy_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            dormancy.run(shutdown_rx).await;
        }
    });

    let cleanup = EventCleanupWorker::new(Arc::clone(&event_log), config.cleanup.clone());
    let cleanup_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            cleanup.run(shutdown_rx).await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = read_commands(Arc::clone(&registry)) => {
            if let Err(e) = result {
                error!(error = %e, "Command input failed");
            }
            info!("Command input closed");
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, dormancy_handle).await {
        warn!(error = %e, "Dormancy checker did not shut down in time");
    }
    if let Err(e) = tokio::time::timeout(shutdown_timeout, cleanup_handle).await {
        warn!(error = %e, "Event cleanup worker did not shut down in time");
    }

    registry.release_all().await;
    info!("Orchestrator shutdown complete");
    Ok(())
}

async fn read_commands(registry: Arc<ProcessorRegistry>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printers: HashMap<String, JoinHandle<Option<u64>>> = HashMap::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let command: Command = match serde_json::from_str(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed command");
                continue;
            }
        };

        let actor = registry.get_or_create(&command.session_id).await;

        // (Re)attach a printer when the session has none or its actor was
        // released, resuming after the last offset already printed.
        let attached = printers
            .get(&command.session_id)
            .is_some_and(|handle| !handle.is_finished());
        if !attached {
            let printed = match printers.remove(&command.session_id) {
                Some(handle) => handle.await.unwrap_or(None),
                None => None,
            };
            let events = registry.subscribe_from(&command.session_id, printed).await;
            printers.insert(
                command.session_id.clone(),
                tokio::spawn(print_events(command.session_id.clone(), events, printed)),
            );
        }

        if let Err(e) = actor.enqueue(command.action) {
            warn!(session_id = %command.session_id, error = %e, "Failed to enqueue action");
        }
    }

    Ok(())
}

/// Print events until the stream ends. Returns the last offset printed.
async fn print_events(
    session_id: String,
    mut events: BoxStream<'static, Result<EventEnvelope, ResumeError>>,
    mut printed: Option<u64>,
) -> Option<u64> {
    while let Some(event) = events.next().await {
        let envelope = match event {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Event stream failed");
                break;
            }
        };

        let output = Output {
            session_id: &session_id,
            envelope: &envelope,
        };
        match serde_json::to_string(&output) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to encode event"),
        }
        printed = Some(envelope.offset);
    }

    printed
}
