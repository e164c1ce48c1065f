//! Generator for backends that stream newline-delimited JSON records.
//!
//! Each line is one record:
//!
//! ```text
//! {"type":"patch","patch":{...}}
//! {"type":"html","html":"<main>...</main>"}
//! ```
//!
//! Records are emitted as they complete. The pass ends with `stats` and a
//! `done` event carrying the final HTML.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use weft_events::{Action, RenderMode, Stats, StreamEvent};
use weft_streaming::{create_stream_with_retry, BoxError, LineAccumulator, RetryConfig};

use super::{EventSink, GenerationError, GenerationRequest, Generator};

/// What a token source is asked to produce.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub session_id: String,
    pub actions: Vec<Action>,
    pub current_html: Option<String>,
}

impl From<&GenerationRequest> for TokenRequest {
    fn from(request: &GenerationRequest) -> Self {
        Self {
            session_id: request.session_id.clone(),
            actions: request.actions.clone(),
            current_html: request.current_html().map(str::to_owned),
        }
    }
}

/// An unreliable token producer, such as a model provider stream.
pub trait TokenSource: Send + Sync + 'static {
    /// Start a fresh token stream for `attempt`.
    fn open(
        &self,
        request: &TokenRequest,
        attempt: u32,
    ) -> BoxStream<'static, Result<String, BoxError>>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Patch { patch: Value },
    Html { html: String },
}

#[derive(Default)]
struct Pass {
    tokens: u64,
    patches: u32,
    last_html: Option<String>,
}

/// Line-protocol generator over a [`TokenSource`].
pub struct LineProtocolGenerator<T> {
    source: Arc<T>,
    retry: RetryConfig,
}

impl<T: TokenSource> LineProtocolGenerator<T> {
    pub fn new(source: T, retry: RetryConfig) -> Self {
        Self {
            source: Arc::new(source),
            retry,
        }
    }

    async fn handle_line(
        &self,
        line: &str,
        pass: &mut Pass,
        sink: &mut EventSink,
    ) -> Result<(), GenerationError> {
        let record: Record =
            serde_json::from_str(line).map_err(|e| GenerationError::MalformedOutput {
                line: line.to_string(),
                reason: e.to_string(),
            })?;

        match record {
            Record::Patch { patch } => {
                sink.emit(StreamEvent::Patch { patch }).await?;
                pass.patches += 1;
            }
            Record::Html { html } => {
                sink.emit(StreamEvent::Html { html: html.clone() }).await?;
                pass.last_html = Some(html);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: TokenSource> Generator for LineProtocolGenerator<T> {
    async fn generate(
        &self,
        request: &GenerationRequest,
        sink: &mut EventSink,
    ) -> Result<(), GenerationError> {
        let started = Instant::now();
        let token_request = TokenRequest::from(request);
        let source = Arc::clone(&self.source);
        let mut tokens = Box::pin(create_stream_with_retry(
            move |attempt| {
                source
                    .open(&token_request, attempt)
                    .map(move |token| token.map(|t| (attempt, t)))
            },
            self.retry,
        ));

        let mut pass = Pass::default();
        let mut lines = LineAccumulator::new();
        let mut current_attempt = 0;

        while let Some(token) = tokens.next().await {
            let (attempt, token) = token?;
            if attempt != current_attempt {
                // A partial record from the failed attempt never completes.
                current_attempt = attempt;
                lines.clear();
            }
            pass.tokens += 1;
            for line in lines.push(&token) {
                self.handle_line(&line, &mut pass, sink).await?;
            }
        }
        // Flush an unterminated final record.
        for line in lines.push("\n") {
            self.handle_line(&line, &mut pass, sink).await?;
        }

        let elapsed = started.elapsed().as_secs_f64();
        let tokens_per_second = if elapsed > 0.0 {
            pass.tokens as f64 / elapsed
        } else {
            0.0
        };
        let mode = if pass.last_html.is_some() {
            RenderMode::Full
        } else {
            RenderMode::Patches
        };

        sink.emit(StreamEvent::Stats(Stats {
            cache_rate: 0.0,
            tokens_per_second,
            mode,
            patch_count: pass.patches,
        }))
        .await?;

        let html = pass
            .last_html
            .or_else(|| request.current_html().map(str::to_owned))
            .unwrap_or_default();
        sink.emit(StreamEvent::Done { html }).await?;

        debug!(
            session_id = %request.session_id,
            tokens = pass.tokens,
            patches = pass.patches,
            mode = %mode,
            "Generation pass complete"
        );
        Ok(())
    }
}
