//! Line framing for chunked text streams.
//!
//! Generative backends emit text in fragments that ignore line boundaries: a
//! fragment may be empty, may end mid-line, or may carry several lines at once.
//! [`LineAccumulator`] buffers the unterminated tail between fragments and
//! releases only complete lines.
//!
//! Only a literal `'\n'` character delimits a line. The two-character escape
//! `\n` inside a JSON string value is ordinary text here.

use futures_core::Stream;
use futures_util::{future, stream, StreamExt};

/// Buffers text fragments and yields complete, non-blank lines.
#[derive(Debug, Default, Clone)]
pub struct LineAccumulator {
    buffer: String,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every line it completed, in order.
    ///
    /// A trailing `'\r'` is stripped from each line; lines that are blank after
    /// that are dropped. Text after the last newline stays buffered.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };

        let tail = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, tail);

        // `complete` ends with '\n', so the final segment is always empty.
        let mut segments: Vec<&str> = complete.split('\n').collect();
        segments.pop();

        segments
            .into_iter()
            .map(|segment| segment.strip_suffix('\r').unwrap_or(segment))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Text received since the last newline.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Drop the unterminated tail, e.g. when the source restarts.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Frame a stream of text fragments into a stream of complete lines.
///
/// A final fragment without a trailing newline is never emitted; use
/// [`accumulate_lines_with_flush`] when the source may end mid-line.
pub fn accumulate_lines<S>(source: S) -> impl Stream<Item = String>
where
    S: Stream,
    S::Item: AsRef<str>,
{
    source
        .scan(LineAccumulator::new(), |acc, fragment| {
            future::ready(Some(stream::iter(acc.push(fragment.as_ref()))))
        })
        .flatten()
}

/// Like [`accumulate_lines`], but appends one synthetic newline after the
/// source ends so an unterminated final line is still emitted.
pub fn accumulate_lines_with_flush<S>(source: S) -> impl Stream<Item = String>
where
    S: Stream,
    S::Item: AsRef<str>,
{
    let source = source
        .map(|fragment| fragment.as_ref().to_owned())
        .chain(stream::once(future::ready("\n".to_owned())));

    accumulate_lines(source)
}
