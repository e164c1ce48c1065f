//! Integration tests for line framing and retrying token streams.

use futures_util::{stream, StreamExt};
use proptest::prelude::*;
use weft_streaming::{accumulate_lines, create_stream_with_retry, LineAccumulator, RetryConfig};

/// Split `text` at the given byte positions (which may repeat, producing
/// empty fragments).
fn chop(text: &str, mut cuts: Vec<usize>) -> Vec<String> {
    for cut in &mut cuts {
        *cut %= text.len() + 1;
    }
    cuts.sort_unstable();

    let mut fragments = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        fragments.push(text[start..cut].to_string());
        start = cut;
    }
    fragments.push(text[start..].to_string());
    fragments
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn chopping_never_changes_the_lines(
        lines in prop::collection::vec("[a-z0-9 {}:,\"\\\\]{0,12}[a-z]", 0..8),
        crlf in prop::collection::vec(any::<bool>(), 8),
        cuts in prop::collection::vec(any::<usize>(), 0..24),
    ) {
        let mut text = String::new();
        for (i, line) in lines.iter().enumerate() {
            text.push_str(line);
            if crlf[i] {
                text.push('\r');
            }
            text.push('\n');
        }

        let fragments = chop(&text, cuts);
        let emitted: Vec<String> = block_on(accumulate_lines(stream::iter(fragments)).collect());

        prop_assert_eq!(emitted, lines);
    }

    #[test]
    fn single_character_fragments(lines in prop::collection::vec("[a-z\\\\]{1,6}", 1..5)) {
        let text: String = lines.iter().map(|l| format!("{l}\n")).collect();

        let mut acc = LineAccumulator::new();
        let mut emitted = Vec::new();
        for ch in text.chars() {
            emitted.extend(acc.push(&ch.to_string()));
        }

        prop_assert_eq!(emitted, lines);
        prop_assert_eq!(acc.pending(), "");
    }
}

#[tokio::test]
async fn retried_tokens_restart_framing_per_attempt() {
    // The first attempt dies after half a record; the second completes. The
    // partial record from attempt 0 is discarded when attempt 1 starts.
    let mut tokens = Box::pin(create_stream_with_retry(
        |attempt| {
            let items: Vec<Result<&str, String>> = if attempt == 0 {
                vec![Ok("{\"type\":\"html\","), Err("connection reset".to_string())]
            } else {
                vec![
                    Ok("{\"type\":\"html\",\"html\":\"<p>"),
                    Ok("hi</p>\"}\n{\"type\":"),
                    Ok("\"html\",\"html\":\"<p>bye</p>\"}"),
                ]
            };
            stream::iter(items.into_iter().map(move |item| item.map(|t| (attempt, t))))
        },
        RetryConfig { max_attempts: 2 },
    ));

    let mut acc = LineAccumulator::new();
    let mut current = 0;
    let mut lines = Vec::new();
    while let Some(token) = tokens.next().await {
        let (attempt, token) = token.unwrap();
        if attempt != current {
            current = attempt;
            acc.clear();
        }
        lines.extend(acc.push(token));
    }
    lines.extend(acc.push("\n"));

    assert_eq!(
        lines,
        vec![
            "{\"type\":\"html\",\"html\":\"<p>hi</p>\"}".to_string(),
            "{\"type\":\"html\",\"html\":\"<p>bye</p>\"}".to_string(),
        ]
    );
}
