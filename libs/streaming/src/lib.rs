//! # weft-streaming
//!
//! Two small streaming primitives used between a generative backend and the
//! session event log.
//!
//! - [`accumulate_lines`] turns arbitrarily chopped text fragments into
//!   newline-delimited logical lines.
//! - [`create_stream_with_retry`] wraps an attempt-parameterized token producer
//!   and restarts it from the beginning when an attempt fails partway.
//!
//! Both are lazy: nothing is pulled from the source until the returned stream
//! is polled, and every item is forwarded as soon as it is available.

mod line;
mod retry;

pub use line::{accumulate_lines, accumulate_lines_with_flush, LineAccumulator};
pub use retry::{create_stream_with_retry, BoxError, RetryConfig, RetryExhausted};
