//! Sandbox provider interface.

use std::time::Duration;

use async_trait::async_trait;

use super::{SandboxError, SandboxExecError};

/// Handle to a live sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub region: String,
}

/// Reference to a built environment snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    pub slug: String,
}

/// Reference to a persistent volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRef {
    pub slug: String,
    pub region: String,
}

/// A secret injected into a sandbox, usable only against `allowed_hosts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    pub env_name: String,
    pub allowed_hosts: Vec<String>,
}

/// Parameters for creating a sandbox.
#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub snapshot: Option<SnapshotRef>,
    pub volume: Option<VolumeRef>,
    pub secrets: Vec<SecretSpec>,
    pub region: String,
    pub timeout: Duration,
    pub memory_mb: u32,
}

/// Parameters for building a snapshot.
#[derive(Debug, Clone)]
pub struct CreateSnapshotRequest {
    /// Package names to install.
    pub dependencies: Vec<String>,
    pub region: String,
    pub slug: String,
    pub capacity_gb: u32,
}

/// Captured result of a successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Sandbox provider interface.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provider identifier used in configuration.
    fn id(&self) -> &str;

    /// Create a sandbox.
    async fn create_sandbox(
        &self,
        request: CreateSandboxRequest,
    ) -> Result<SandboxHandle, SandboxError>;

    /// Terminate a sandbox. Terminating an unknown sandbox succeeds.
    async fn terminate_sandbox(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Run code inside a live sandbox.
    async fn exec(&self, handle: &SandboxHandle, code: &str)
        -> Result<ExecOutput, SandboxExecError>;

    async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
    ) -> Result<SnapshotRef, SandboxError>;

    async fn snapshot_exists(&self, slug: &str) -> Result<bool, SandboxError>;

    async fn delete_snapshot(&self, slug: &str) -> Result<(), SandboxError>;

    async fn volume_exists(&self, slug: &str) -> Result<bool, SandboxError>;

    async fn create_volume(&self, slug: &str, region: &str) -> Result<VolumeRef, SandboxError>;

    async fn delete_volume(&self, slug: &str) -> Result<(), SandboxError>;
}
