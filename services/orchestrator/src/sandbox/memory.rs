//! In-process sandbox provider.
//!
//! Keeps snapshots, volumes and sandboxes in memory. Backs the `memory`
//! provider setting and is the provider used throughout the tests, so it
//! counts every round trip and can be told to fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use ulid::Ulid;

use super::provider::{
    CreateSandboxRequest, CreateSnapshotRequest, ExecOutput, SandboxHandle, SandboxProvider,
    SnapshotRef, VolumeRef,
};
use super::{SandboxError, SandboxExecError};

#[derive(Default)]
struct MemoryState {
    /// slug -> installed packages
    snapshots: HashMap<String, Vec<String>>,
    /// slug -> region
    volumes: HashMap<String, String>,
    /// sandbox id -> creation request
    sandboxes: HashMap<String, CreateSandboxRequest>,
    terminated: HashSet<String>,
    exec_failure: Option<SandboxExecError>,
}

/// In-memory sandbox provider.
#[derive(Default)]
pub struct InMemorySandboxProvider {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,

    fail_sandboxes: AtomicBool,
    fail_snapshots: AtomicBool,

    snapshot_builds: AtomicU64,
    existence_checks: AtomicU64,
    sandboxes_created: AtomicU64,
    sandboxes_terminated: AtomicU64,
    volumes_created: AtomicU64,
}

impl InMemorySandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every provisioning call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Pre-register a snapshot, as if built by an earlier process.
    pub fn with_snapshot(self, slug: impl Into<String>) -> Self {
        self.lock().snapshots.insert(slug.into(), Vec::new());
        self
    }

    /// Pre-register a volume.
    pub fn with_volume(self, slug: impl Into<String>, region: impl Into<String>) -> Self {
        self.lock().volumes.insert(slug.into(), region.into());
        self
    }

    /// Make `create_sandbox` fail until reset.
    pub fn set_fail_sandboxes(&self, fail: bool) {
        self.fail_sandboxes.store(fail, Ordering::SeqCst);
    }

    /// Make `create_snapshot` fail until reset.
    pub fn set_fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    /// Make every `exec` fail with `error` until cleared with `None`.
    pub fn set_exec_failure(&self, error: Option<SandboxExecError>) {
        self.lock().exec_failure = error;
    }

    pub fn snapshot_builds(&self) -> u64 {
        self.snapshot_builds.load(Ordering::SeqCst)
    }

    pub fn existence_checks(&self) -> u64 {
        self.existence_checks.load(Ordering::SeqCst)
    }

    pub fn sandboxes_created(&self) -> u64 {
        self.sandboxes_created.load(Ordering::SeqCst)
    }

    pub fn sandboxes_terminated(&self) -> u64 {
        self.sandboxes_terminated.load(Ordering::SeqCst)
    }

    pub fn volumes_created(&self) -> u64 {
        self.volumes_created.load(Ordering::SeqCst)
    }

    /// Number of sandboxes created and not yet terminated.
    pub fn live_sandboxes(&self) -> usize {
        let state = self.lock();
        state
            .sandboxes
            .keys()
            .filter(|id| !state.terminated.contains(*id))
            .count()
    }

    pub fn has_snapshot(&self, slug: &str) -> bool {
        self.lock().snapshots.contains_key(slug)
    }

    pub fn has_volume(&self, slug: &str) -> bool {
        self.lock().volumes.contains_key(slug)
    }

    /// Packages a snapshot was built with.
    pub fn snapshot_packages(&self, slug: &str) -> Option<Vec<String>> {
        self.lock().snapshots.get(slug).cloned()
    }

    /// Creation request recorded for a sandbox.
    pub fn sandbox_request(&self, sandbox_id: &str) -> Option<CreateSandboxRequest> {
        self.lock().sandboxes.get(sandbox_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SandboxProvider for InMemorySandboxProvider {
    fn id(&self) -> &str {
        "memory"
    }

    async fn create_sandbox(
        &self,
        request: CreateSandboxRequest,
    ) -> Result<SandboxHandle, SandboxError> {
        self.simulate_latency().await;

        if self.fail_sandboxes.load(Ordering::SeqCst) {
            return Err(SandboxError::new("memory provider configured to fail"));
        }

        let mut state = self.lock();
        if let Some(snapshot) = &request.snapshot {
            if !state.snapshots.contains_key(&snapshot.slug) {
                return Err(SandboxError::new(format!(
                    "snapshot {} does not exist",
                    snapshot.slug
                )));
            }
        }
        if let Some(volume) = &request.volume {
            if !state.volumes.contains_key(&volume.slug) {
                return Err(SandboxError::new(format!(
                    "volume {} does not exist",
                    volume.slug
                )));
            }
        }

        let sandbox_id = format!("sbx_{}", Ulid::new().to_string().to_lowercase());
        let handle = SandboxHandle {
            sandbox_id: sandbox_id.clone(),
            region: request.region.clone(),
        };
        info!(
            sandbox_id = %sandbox_id,
            region = %request.region,
            secrets = request.secrets.len(),
            "[MEMORY] Sandbox created"
        );
        state.sandboxes.insert(sandbox_id, request);
        self.sandboxes_created.fetch_add(1, Ordering::SeqCst);

        Ok(handle)
    }

    async fn terminate_sandbox(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let mut state = self.lock();
        if state.sandboxes.contains_key(&handle.sandbox_id)
            && state.terminated.insert(handle.sandbox_id.clone())
        {
            self.sandboxes_terminated.fetch_add(1, Ordering::SeqCst);
            debug!(sandbox_id = %handle.sandbox_id, "[MEMORY] Sandbox terminated");
        }
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        code: &str,
    ) -> Result<ExecOutput, SandboxExecError> {
        let state = self.lock();
        if let Some(err) = &state.exec_failure {
            return Err(err.clone());
        }
        if !state.sandboxes.contains_key(&handle.sandbox_id)
            || state.terminated.contains(&handle.sandbox_id)
        {
            return Err(SandboxExecError {
                message: format!("sandbox {} is not running", handle.sandbox_id),
                output: String::new(),
            });
        }

        Ok(ExecOutput {
            stdout: code.to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
    ) -> Result<SnapshotRef, SandboxError> {
        self.snapshot_builds.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(SandboxError::new(format!(
                "snapshot build failed for {}",
                request.slug
            )));
        }

        info!(
            slug = %request.slug,
            packages = request.dependencies.len(),
            "[MEMORY] Snapshot built"
        );
        self.lock()
            .snapshots
            .insert(request.slug.clone(), request.dependencies);

        Ok(SnapshotRef { slug: request.slug })
    }

    async fn snapshot_exists(&self, slug: &str) -> Result<bool, SandboxError> {
        self.existence_checks.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        Ok(self.lock().snapshots.contains_key(slug))
    }

    async fn delete_snapshot(&self, slug: &str) -> Result<(), SandboxError> {
        self.lock().snapshots.remove(slug);
        Ok(())
    }

    async fn volume_exists(&self, slug: &str) -> Result<bool, SandboxError> {
        Ok(self.lock().volumes.contains_key(slug))
    }

    async fn create_volume(&self, slug: &str, region: &str) -> Result<VolumeRef, SandboxError> {
        let mut state = self.lock();
        if state.volumes.contains_key(slug) {
            return Err(SandboxError::new(format!("volume {slug} already exists")));
        }
        state.volumes.insert(slug.to_string(), region.to_string());
        self.volumes_created.fetch_add(1, Ordering::SeqCst);

        Ok(VolumeRef {
            slug: slug.to_string(),
            region: region.to_string(),
        })
    }

    async fn delete_volume(&self, slug: &str) -> Result<(), SandboxError> {
        self.lock().volumes.remove(slug);
        Ok(())
    }
}
