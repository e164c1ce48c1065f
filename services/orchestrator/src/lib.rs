//! weft session orchestrator.
//!
//! Ships the `weft-orchestrator` binary; the library surface exists for
//! integration testing and for embedding behind a transport layer.

pub mod actors;
pub mod config;
pub mod event_log;
pub mod generation;
pub mod jobs;
pub mod resume;
pub mod sandbox;
