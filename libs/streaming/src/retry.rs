//! Whole-attempt retry for unreliable token streams.
//!
//! A producer is invoked with the attempt index and returns a fresh token
//! stream. Tokens are forwarded the moment they arrive. If an attempt fails
//! partway, everything it already forwarded stays forwarded, the rest of that
//! attempt is abandoned, and the producer is invoked again from its own
//! beginning. Consumers therefore see repeated prefixes across attempts:
//!
//! ```text
//! attempt 0: a b <err>
//! attempt 1: a b c <end>
//! output:    a b a b c
//! ```

use std::pin::Pin;

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

/// Boxed error type accepted from token producers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// The token stream never completed within the attempt budget.
#[derive(Debug, Error)]
#[error("token stream did not complete after {attempts} attempts")]
pub struct RetryExhausted {
    /// Number of attempts made.
    pub attempts: u32,

    /// Failure of the final attempt.
    #[source]
    pub last_error: Option<BoxError>,
}

struct RetryState<F, S> {
    producer: F,
    current: Option<Pin<Box<S>>>,
    attempt: u32,
    max_attempts: u32,
    last_error: Option<BoxError>,
    finished: bool,
}

/// Drive `producer` until one attempt completes cleanly or the budget runs out.
///
/// The returned stream yields `Ok(token)` for every forwarded token. It ends
/// without error after a clean attempt, or yields a single
/// `Err(RetryExhausted)` and ends once `max_attempts` attempts have failed.
pub fn create_stream_with_retry<F, S, T, E>(
    producer: F,
    config: RetryConfig,
) -> impl Stream<Item = Result<T, RetryExhausted>>
where
    F: FnMut(u32) -> S,
    S: Stream<Item = Result<T, E>>,
    E: Into<BoxError>,
{
    let state = RetryState {
        producer,
        current: None,
        attempt: 0,
        max_attempts: config.max_attempts,
        last_error: None,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if state.current.is_none() {
                if state.attempt >= state.max_attempts {
                    state.finished = true;
                    let exhausted = RetryExhausted {
                        attempts: state.attempt,
                        last_error: state.last_error.take(),
                    };
                    return Some((Err(exhausted), state));
                }

                if state.attempt > 0 {
                    debug!(attempt = state.attempt, "Restarting token stream");
                }
                let attempt = state.attempt;
                state.current = Some(Box::pin((state.producer)(attempt)));
            }

            let Some(current) = state.current.as_mut() else {
                continue;
            };
            let item = current.next().await;
            match item {
                Some(Ok(token)) => return Some((Ok(token), state)),
                Some(Err(err)) => {
                    let err: BoxError = err.into();
                    warn!(
                        attempt = state.attempt,
                        max_attempts = state.max_attempts,
                        error = %err,
                        "Token stream attempt failed"
                    );
                    state.current = None;
                    state.attempt += 1;
                    state.last_error = Some(err);
                }
                None => {
                    state.finished = true;
                    return None;
                }
            }
        }
    })
}
