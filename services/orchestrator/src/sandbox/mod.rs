//! Sandbox pool.
//!
//! - [`SandboxProvider`]: external provider contract
//! - [`InMemorySandboxProvider`]: in-process provider
//! - [`SandboxManager`]: snapshot caching, per-session provisioning, volumes

mod config;
mod error;
mod manager;
mod memory;
mod provider;

pub use config::{SandboxConfig, SandboxDependency, SandboxInitMode, SandboxScope};
pub use error::{SandboxError, SandboxExecError, SandboxFailure};
pub use manager::{
    config_hash, volume_slug, ManagedSandbox, SandboxLease, SandboxManager, SandboxRef,
};
pub use memory::InMemorySandboxProvider;
pub use provider::{
    CreateSandboxRequest, CreateSnapshotRequest, ExecOutput, SandboxHandle, SandboxProvider,
    SecretSpec, SnapshotRef, VolumeRef,
};
