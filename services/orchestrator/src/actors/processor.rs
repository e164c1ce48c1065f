//! Per-session processing loop.
//!
//! Drains the action queue in batches, runs generation for each batch and
//! records the resulting events. Runs until the owning scope aborts it.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use weft_events::{Action, EventEnvelope};

use super::registry::ActorDeps;
use crate::generation::{next_offset_after, EventSink, GenerationError, GenerationRequest};
use crate::sandbox::SandboxLease;

const OFFSET_RETRY_DELAY: Duration = Duration::from_secs(1);

pub(crate) struct ProcessorContext {
    pub session_id: String,
    pub actions: mpsc::UnboundedReceiver<Action>,
    pub events: broadcast::Sender<EventEnvelope>,
    pub sandbox: SandboxLease,
    pub deps: ActorDeps,
}

pub(crate) async fn run_processing_loop(mut ctx: ProcessorContext) {
    let next_offset = resolve_next_offset(&ctx).await;
    let mut sink = EventSink::new(
        ctx.session_id.clone(),
        next_offset,
        ctx.deps.event_log.clone(),
        ctx.events.clone(),
    );
    debug!(session_id = %ctx.session_id, next_offset, "Processing loop started");

    let max_batch = ctx.deps.config.max_batch_actions.max(1);
    while let Some(batch) = next_batch(&mut ctx.actions, max_batch).await {
        process_batch(&ctx, &mut sink, batch).await;
    }

    debug!(session_id = %ctx.session_id, "Action queue closed");
}

/// Continue after the highest offset already in the log.
async fn resolve_next_offset(ctx: &ProcessorContext) -> u64 {
    loop {
        match ctx.deps.event_log.latest_offset(&ctx.session_id).await {
            Ok(latest) => return next_offset_after(latest),
            Err(e) => {
                warn!(
                    session_id = %ctx.session_id,
                    error = %e,
                    "Failed to read latest offset; retrying"
                );
                tokio::time::sleep(OFFSET_RETRY_DELAY).await;
            }
        }
    }
}

/// Wait for one action, then take whatever else is already queued, up to `max`.
pub(crate) async fn next_batch(
    actions: &mut mpsc::UnboundedReceiver<Action>,
    max: usize,
) -> Option<Vec<Action>> {
    let first = actions.recv().await?;
    let mut batch = vec![first];
    while batch.len() < max {
        match actions.try_recv() {
            Ok(action) => batch.push(action),
            Err(_) => break,
        }
    }
    Some(batch)
}

async fn process_batch(ctx: &ProcessorContext, sink: &mut EventSink, actions: Vec<Action>) {
    let attempts = ctx.deps.config.generation_attempts.max(1);
    let mut request = GenerationRequest {
        session_id: ctx.session_id.clone(),
        actions,
        attempt: 0,
        sandbox: ctx.sandbox.clone(),
    };

    for attempt in 0..attempts {
        request.attempt = attempt;

        match ctx.deps.generator.generate(&request, sink).await {
            Ok(()) => {
                info!(
                    session_id = %ctx.session_id,
                    actions = request.actions.len(),
                    attempt,
                    next_offset = sink.next_offset(),
                    "Batch processed"
                );
                return;
            }
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                warn!(
                    session_id = %ctx.session_id,
                    attempt,
                    error = %e,
                    "Generation failed; retrying batch"
                );
            }
            Err(e) => {
                error!(
                    session_id = %ctx.session_id,
                    attempt,
                    error = %e,
                    "Generation failed; dropping batch"
                );
                if matches!(e, GenerationError::EventLog(_)) {
                    if let Err(e) = sink.resync().await {
                        warn!(session_id = %ctx.session_id, error = %e, "Offset resync failed");
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_next_batch_caps_size_and_keeps_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            tx.send(Action::prompt(format!("p{i}"))).unwrap();
        }

        let first = next_batch(&mut rx, 3).await.unwrap();
        let prompts: Vec<_> = first.iter().filter_map(Action::prompt_text).collect();
        assert_eq!(prompts, vec!["p0", "p1", "p2"]);

        let second = next_batch(&mut rx, 3).await.unwrap();
        assert_eq!(second.len(), 2);

        drop(tx);
        assert!(next_batch(&mut rx, 3).await.is_none());
    }
}
