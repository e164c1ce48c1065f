//! Deterministic generator that renders the actions it receives.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use weft_events::{Action, RenderMode, Stats, StreamEvent};

use super::{EventSink, GenerationError, GenerationRequest, Generator};

/// Action name that runs `actionData.code` in the session sandbox.
pub const RUN_ACTION: &str = "run";

/// Renders each action as a paragraph of a full HTML document.
///
/// A `run` action with a string `code` field executes it in the sandbox and
/// renders the captured output.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoGenerator;

impl EchoGenerator {
    pub fn new() -> Self {
        Self
    }

    async fn render_action(
        &self,
        action: &Action,
        request: &GenerationRequest,
    ) -> Result<String, GenerationError> {
        match action {
            Action::Prompt { prompt, .. } => Ok(format!(
                "<p class=\"prompt\">{}</p>",
                escape_html(prompt.as_deref().unwrap_or_default())
            )),
            Action::Interaction {
                action: Some(name),
                action_data,
                ..
            } if name == RUN_ACTION => {
                let code = action_data
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let output = request.sandbox.exec(code).await?;
                Ok(format!("<pre class=\"output\">{}</pre>", escape_html(&output.stdout)))
            }
            Action::Interaction { action, .. } => Ok(format!(
                "<p class=\"action\">{}</p>",
                escape_html(action.as_deref().unwrap_or_default())
            )),
        }
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        sink: &mut EventSink,
    ) -> Result<(), GenerationError> {
        let mut body = String::new();
        for action in &request.actions {
            body.push_str(&self.render_action(action, request).await?);
        }
        let html = format!("<main>{body}</main>");

        sink.emit(StreamEvent::Html { html: html.clone() }).await?;
        sink.emit(StreamEvent::Stats(Stats {
            cache_rate: 0.0,
            tokens_per_second: 0.0,
            mode: RenderMode::Full,
            patch_count: 0,
        }))
        .await?;
        let done = sink.emit(StreamEvent::Done { html }).await?;

        debug!(
            session_id = %request.session_id,
            actions = request.actions.len(),
            done_offset = done,
            "Echo pass complete"
        );
        Ok(())
    }
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventLog, SqliteEventLog};
    use crate::sandbox::{
        InMemorySandboxProvider, SandboxConfig, SandboxExecError, SandboxManager, SandboxRef,
    };
    use serde_json::{json, Map};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Fixture {
        log: Arc<dyn EventLog>,
        provider: Arc<InMemorySandboxProvider>,
        request: GenerationRequest,
        sink: EventSink,
    }

    fn fixture(actions: Vec<Action>) -> Fixture {
        let log: Arc<dyn EventLog> =
            Arc::new(SqliteEventLog::open_in_memory(Duration::from_secs(600)).unwrap());
        let provider = Arc::new(InMemorySandboxProvider::new());
        let manager = Arc::new(SandboxManager::new(
            provider.clone(),
            SandboxConfig::default(),
        ));
        let (tx, _) = broadcast::channel(16);

        Fixture {
            sink: EventSink::new("s1", 0, Arc::clone(&log), tx),
            request: GenerationRequest {
                session_id: "s1".into(),
                actions,
                attempt: 0,
                sandbox: manager.lease("s1", &SandboxRef::new()),
            },
            log,
            provider,
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<b a="1">&'"#),
            "&lt;b a=&quot;1&quot;&gt;&amp;&#39;"
        );
    }

    #[tokio::test]
    async fn test_echo_emits_html_stats_done() {
        let mut f = fixture(vec![
            Action::prompt("hello <world>"),
            Action::interaction("save", Map::new()),
        ]);

        EchoGenerator::new()
            .generate(&f.request, &mut f.sink)
            .await
            .unwrap();

        let rows = f.log.read_from("s1", None).await.unwrap();
        let types: Vec<&str> = rows.iter().map(|r| r.event_type.as_str()).collect();
        assert_eq!(types, vec!["html", "stats", "done"]);
        let expected = concat!(
            "<main><p class=\"prompt\">hello &lt;world&gt;</p>",
            "<p class=\"action\">save</p></main>"
        );
        assert_eq!(rows[2].event.html(), Some(expected));
        assert_eq!(f.provider.sandboxes_created(), 0);
    }

    #[tokio::test]
    async fn test_run_action_uses_sandbox() {
        let mut data = Map::new();
        data.insert("code".into(), json!("print('hi')"));
        let mut f = fixture(vec![Action::interaction(RUN_ACTION, data)]);

        EchoGenerator::new()
            .generate(&f.request, &mut f.sink)
            .await
            .unwrap();

        let last = f.log.last_html_event("s1").await.unwrap().unwrap();
        assert!(last.event.html().unwrap().contains("print(&#39;hi&#39;)"));
        assert_eq!(f.provider.sandboxes_created(), 1);
    }

    #[tokio::test]
    async fn test_sandbox_exec_failure_is_fatal() {
        let mut data = Map::new();
        data.insert("code".into(), json!("raise"));
        let mut f = fixture(vec![Action::interaction(RUN_ACTION, data)]);
        f.provider.set_exec_failure(Some(SandboxExecError {
            message: "exit 1".into(),
            output: "Traceback".into(),
        }));

        let err = EchoGenerator::new()
            .generate(&f.request, &mut f.sink)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::SandboxExec(ref e) if e.output == "Traceback"));
        assert!(!err.is_retryable());
        assert_eq!(f.log.latest_offset("s1").await.unwrap(), None);
    }
}
