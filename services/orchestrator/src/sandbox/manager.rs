//! Sandbox manager.
//!
//! Resolves the environment snapshot for the configured dependency set once
//! per process, provisions per-session sandboxes on top of it, and owns each
//! sandbox through a [`Scope`] whose finalizer terminates it.

use std::collections::BTreeSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::provider::{
    CreateSandboxRequest, CreateSnapshotRequest, ExecOutput, SandboxHandle, SandboxProvider,
    SecretSpec, SnapshotRef, VolumeRef,
};
use super::{
    SandboxConfig, SandboxDependency, SandboxError, SandboxFailure, SandboxInitMode, SandboxScope,
};
use crate::actors::Scope;

const SNAPSHOT_PREFIX: &str = "weft-env";
const VOLUME_PREFIX: &str = "weft-vol";

/// Order-independent digest of the dependency package names.
///
/// Names are deduplicated and sorted before hashing, so declaration order
/// never changes the result.
pub fn config_hash(dependencies: &[SandboxDependency]) -> String {
    let packages: BTreeSet<&str> = dependencies.iter().map(|d| d.package.as_str()).collect();
    let canonical = packages.into_iter().collect::<Vec<_>>().join("\n");
    short_digest(&canonical)
}

/// Deterministic volume slug for a session.
pub fn volume_slug(session_id: &str) -> String {
    format!("{VOLUME_PREFIX}-{}", short_digest(session_id))
}

fn short_digest(input: &str) -> String {
    let mut hex = hex::encode(Sha256::digest(input.as_bytes()));
    hex.truncate(16);
    hex
}

/// A provisioned sandbox and the scope that owns it.
pub struct ManagedSandbox {
    pub handle: SandboxHandle,
    scope: Scope,
}

/// An actor's sandbox slot. Empty until first provisioned, and again after
/// release.
#[derive(Clone, Default)]
pub struct SandboxRef {
    slot: Arc<Mutex<Option<ManagedSandbox>>>,
    /// Held for the whole of a creation, including after the caller is gone.
    creating: Arc<Mutex<()>>,
}

impl SandboxRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current handle, if provisioned.
    pub async fn handle(&self) -> Option<SandboxHandle> {
        self.slot.lock().await.as_ref().map(|m| m.handle.clone())
    }

    pub async fn is_populated(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

/// Sandbox manager.
pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    config: SandboxConfig,
    config_hash: String,
    snapshot: OnceCell<SnapshotRef>,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: SandboxConfig) -> Self {
        let config_hash = config_hash(&config.dependencies);
        Self {
            provider,
            config,
            config_hash,
            snapshot: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn snapshot_slug(&self) -> String {
        format!("{SNAPSHOT_PREFIX}-{}", self.config_hash)
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Resolve the environment snapshot, building it if needed.
    ///
    /// Concurrent first callers share a single resolution. Failures are not
    /// cached; the next call tries again.
    pub async fn ensure_snapshot(&self) -> Result<SnapshotRef, SandboxError> {
        self.snapshot
            .get_or_try_init(|| self.resolve_snapshot())
            .await
            .cloned()
    }

    async fn resolve_snapshot(&self) -> Result<SnapshotRef, SandboxError> {
        let slug = self.snapshot_slug();

        if self.provider.snapshot_exists(&slug).await? {
            info!(slug = %slug, "Adopted existing sandbox snapshot");
            return Ok(SnapshotRef { slug });
        }

        // A half-built snapshot or orphaned volume may still hold the slug.
        if let Err(e) = self.provider.delete_snapshot(&slug).await {
            warn!(slug = %slug, error = %e, "Failed to delete stale snapshot");
        }
        if let Err(e) = self.provider.delete_volume(&slug).await {
            warn!(slug = %slug, error = %e, "Failed to delete stale volume");
        }

        let request = CreateSnapshotRequest {
            dependencies: self
                .config
                .dependencies
                .iter()
                .map(|d| d.package.clone())
                .collect(),
            region: self.config.region.clone(),
            slug: slug.clone(),
            capacity_gb: self.config.capacity_gb,
        };
        let snapshot = self.provider.create_snapshot(request).await?;

        info!(
            slug = %snapshot.slug,
            packages = self.config.dependencies.len(),
            "Built sandbox snapshot"
        );
        Ok(snapshot)
    }

    /// Secrets for every dependency that declares one.
    pub fn secrets(&self) -> Vec<SecretSpec> {
        self.config
            .dependencies
            .iter()
            .filter_map(|d| {
                d.secret_env.as_ref().map(|env_name| SecretSpec {
                    env_name: env_name.clone(),
                    allowed_hosts: d.allowed_hosts.clone(),
                })
            })
            .collect()
    }

    /// Return the sandbox in `sandbox_ref`, creating it if the slot is empty.
    ///
    /// Concurrent callers for one actor never create two. The provider call
    /// runs on its own task, which fills the slot even if the caller is
    /// cancelled, so a later [`release_sandbox`](Self::release_sandbox)
    /// always finds and terminates the sandbox.
    pub async fn get_or_create_sandbox(
        &self,
        session_id: &str,
        sandbox_ref: &SandboxRef,
        volume_slug: Option<&str>,
    ) -> Result<SandboxHandle, SandboxError> {
        if let Some(handle) = sandbox_ref.handle().await {
            return Ok(handle);
        }

        let permit = Arc::clone(&sandbox_ref.creating).lock_owned().await;
        if let Some(handle) = sandbox_ref.handle().await {
            return Ok(handle);
        }

        let snapshot = self.ensure_snapshot().await?;
        let request = CreateSandboxRequest {
            snapshot: Some(snapshot),
            volume: volume_slug.map(|slug| VolumeRef {
                slug: slug.to_string(),
                region: self.config.region.clone(),
            }),
            secrets: self.secrets(),
            region: self.config.region.clone(),
            timeout: self.config.timeout,
            memory_mb: self.config.memory_mb,
        };

        let provider = Arc::clone(&self.provider);
        let slot = Arc::clone(&sandbox_ref.slot);
        let session_id = session_id.to_string();
        let creation = tokio::spawn(async move {
            let _permit = permit;
            let handle = provider.create_sandbox(request).await?;

            let scope = Scope::new(format!("sandbox:{session_id}"));
            let terminate = handle.clone();
            let finalizer_provider = Arc::clone(&provider);
            scope.add_finalizer(async move {
                if let Err(e) = finalizer_provider.terminate_sandbox(&terminate).await {
                    warn!(
                        sandbox_id = %terminate.sandbox_id,
                        error = %e,
                        "Failed to terminate sandbox"
                    );
                }
            });

            info!(
                session_id = %session_id,
                sandbox_id = %handle.sandbox_id,
                "Sandbox provisioned"
            );
            *slot.lock().await = Some(ManagedSandbox {
                handle: handle.clone(),
                scope,
            });
            Ok::<_, SandboxError>(handle)
        });

        creation
            .await
            .map_err(|e| SandboxError::with_cause("sandbox creation task failed", e))?
    }

    /// Close the sandbox held in `sandbox_ref` and clear the slot.
    ///
    /// Waits for an in-flight creation to land first.
    pub async fn release_sandbox(&self, sandbox_ref: &SandboxRef) {
        let _creating = sandbox_ref.creating.lock().await;
        let managed = sandbox_ref.slot.lock().await.take();
        if let Some(managed) = managed {
            debug!(sandbox_id = %managed.handle.sandbox_id, "Releasing sandbox");
            managed.scope.close().await;
        }
    }

    pub async fn volume_exists(&self, session_id: &str) -> Result<bool, SandboxError> {
        self.provider.volume_exists(&volume_slug(session_id)).await
    }

    pub async fn create_volume(&self, session_id: &str) -> Result<VolumeRef, SandboxError> {
        self.provider
            .create_volume(&volume_slug(session_id), &self.config.region)
            .await
    }

    pub async fn delete_volume(&self, slug: &str) -> Result<(), SandboxError> {
        self.provider.delete_volume(slug).await
    }

    /// Make sure the session's volume exists and return its slug.
    pub async fn ensure_session_volume(&self, session_id: &str) -> Result<String, SandboxError> {
        let slug = volume_slug(session_id);
        if self.provider.volume_exists(&slug).await? {
            return Ok(slug);
        }

        match self.create_volume(session_id).await {
            Ok(volume) => Ok(volume.slug),
            Err(e) => {
                // Lost a creation race with another provisioning path.
                if self.provider.volume_exists(&slug).await.unwrap_or(false) {
                    debug!(slug = %slug, error = %e, "Volume appeared concurrently");
                    Ok(slug)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Provision the session's sandbox according to the configured scope.
    pub async fn provision(
        &self,
        session_id: &str,
        sandbox_ref: &SandboxRef,
    ) -> Result<SandboxHandle, SandboxError> {
        if let Some(handle) = sandbox_ref.handle().await {
            return Ok(handle);
        }

        let volume = match self.config.scope {
            SandboxScope::Session => Some(self.ensure_session_volume(session_id).await?),
            SandboxScope::User => None,
        };
        self.get_or_create_sandbox(session_id, sandbox_ref, volume.as_deref())
            .await
    }

    /// Best-effort provisioning ahead of first use. A no-op in lazy mode.
    pub async fn warm_start(
        &self,
        session_id: &str,
        sandbox_ref: &SandboxRef,
    ) -> Result<Option<SandboxHandle>, SandboxError> {
        match self.config.init_mode {
            SandboxInitMode::Lazy => Ok(None),
            SandboxInitMode::Eager => self.provision(session_id, sandbox_ref).await.map(Some),
        }
    }

    /// Provision if needed, then run `code`.
    pub async fn exec(
        &self,
        session_id: &str,
        sandbox_ref: &SandboxRef,
        code: &str,
    ) -> Result<ExecOutput, SandboxFailure> {
        let handle = self.provision(session_id, sandbox_ref).await?;
        Ok(self.provider.exec(&handle, code).await?)
    }

    /// A session-bound view of this manager for generation code.
    pub fn lease(self: &Arc<Self>, session_id: &str, sandbox_ref: &SandboxRef) -> SandboxLease {
        SandboxLease {
            manager: Arc::clone(self),
            sandbox: sandbox_ref.clone(),
            session_id: session_id.to_string(),
        }
    }
}

/// Lazily provisioned access to one session's sandbox.
#[derive(Clone)]
pub struct SandboxLease {
    manager: Arc<SandboxManager>,
    sandbox: SandboxRef,
    session_id: String,
}

impl SandboxLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Provision on first use and return the handle.
    pub async fn handle(&self) -> Result<SandboxHandle, SandboxError> {
        self.manager.provision(&self.session_id, &self.sandbox).await
    }

    pub async fn is_provisioned(&self) -> bool {
        self.sandbox.is_populated().await
    }

    pub async fn exec(&self, code: &str) -> Result<ExecOutput, SandboxFailure> {
        self.manager.exec(&self.session_id, &self.sandbox, code).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::InMemorySandboxProvider;
    use rstest::rstest;
    use std::time::Duration;

    fn deps(names: &[&str]) -> Vec<SandboxDependency> {
        names.iter().map(|n| SandboxDependency::new(*n)).collect()
    }

    fn manager_with(
        provider: InMemorySandboxProvider,
        config: SandboxConfig,
    ) -> (Arc<InMemorySandboxProvider>, Arc<SandboxManager>) {
        let provider = Arc::new(provider);
        let manager = Arc::new(SandboxManager::new(provider.clone(), config));
        (provider, manager)
    }

    #[rstest]
    #[case(&["numpy", "pandas"], &["pandas", "numpy"])]
    #[case(&["a", "b", "c"], &["c", "a", "b"])]
    #[case(&["numpy", "numpy", "pandas"], &["pandas", "numpy"])]
    fn test_config_hash_is_order_independent(#[case] left: &[&str], #[case] right: &[&str]) {
        assert_eq!(config_hash(&deps(left)), config_hash(&deps(right)));
    }

    #[test]
    fn test_config_hash_tracks_package_set() {
        let base = config_hash(&deps(&["numpy", "pandas"]));
        assert_ne!(base, config_hash(&deps(&["numpy", "pandas", "scipy"])));
        assert_ne!(base, config_hash(&deps(&["numpy"])));
        assert_eq!(base.len(), 16);
    }

    #[test]
    fn test_hash_ignores_non_package_fields() {
        let mut with_secret = deps(&["openai"]);
        with_secret[0].secret_env = Some("OPENAI_API_KEY".into());
        with_secret[0].docs = vec!["https://docs".into()];
        assert_eq!(config_hash(&with_secret), config_hash(&deps(&["openai"])));
    }

    #[test]
    fn test_volume_slug_is_deterministic() {
        assert_eq!(volume_slug("s1"), volume_slug("s1"));
        assert_ne!(volume_slug("s1"), volume_slug("s2"));
        assert!(volume_slug("s1").starts_with("weft-vol-"));
    }

    #[tokio::test]
    async fn test_concurrent_ensure_snapshot_resolves_once() {
        let (provider, manager) = manager_with(
            InMemorySandboxProvider::new().with_latency(Duration::from_millis(20)),
            SandboxConfig {
                dependencies: deps(&["numpy"]),
                ..Default::default()
            },
        );

        let calls = (0..16).map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure_snapshot().await })
        });
        let results = futures_util::future::join_all(calls).await;

        for result in results {
            assert_eq!(result.unwrap().unwrap().slug, manager.snapshot_slug());
        }
        assert_eq!(provider.existence_checks(), 1);
        assert_eq!(provider.snapshot_builds(), 1);

        manager.ensure_snapshot().await.unwrap();
        assert_eq!(provider.existence_checks(), 1);
        assert_eq!(
            provider.snapshot_packages(&manager.snapshot_slug()),
            Some(vec!["numpy".to_string()])
        );
    }

    #[tokio::test]
    async fn test_existing_snapshot_is_adopted() {
        let slug = format!("weft-env-{}", config_hash(&[]));
        let (provider, manager) = manager_with(
            InMemorySandboxProvider::new().with_snapshot(slug.clone()),
            SandboxConfig::default(),
        );

        assert_eq!(manager.ensure_snapshot().await.unwrap().slug, slug);
        assert_eq!(provider.snapshot_builds(), 0);
    }

    #[tokio::test]
    async fn test_stale_volume_removed_before_build() {
        let slug = format!("weft-env-{}", config_hash(&[]));
        let (provider, manager) = manager_with(
            InMemorySandboxProvider::new().with_volume(slug.clone(), "us-east-1"),
            SandboxConfig::default(),
        );

        manager.ensure_snapshot().await.unwrap();
        assert!(!provider.has_volume(&slug));
        assert!(provider.has_snapshot(&slug));
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_not_cached() {
        let (provider, manager) =
            manager_with(InMemorySandboxProvider::new(), SandboxConfig::default());

        provider.set_fail_snapshots(true);
        assert!(manager.ensure_snapshot().await.is_err());

        provider.set_fail_snapshots(false);
        assert!(manager.ensure_snapshot().await.is_ok());
        assert_eq!(provider.snapshot_builds(), 2);
    }

    #[tokio::test]
    async fn test_sandbox_reused_until_released() {
        let (provider, manager) =
            manager_with(InMemorySandboxProvider::new(), SandboxConfig::default());
        let sandbox = SandboxRef::new();

        let first = manager
            .get_or_create_sandbox("s1", &sandbox, None)
            .await
            .unwrap();
        let second = manager
            .get_or_create_sandbox("s1", &sandbox, None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.sandboxes_created(), 1);

        manager.release_sandbox(&sandbox).await;
        manager.release_sandbox(&sandbox).await;
        assert!(!sandbox.is_populated().await);
        assert_eq!(provider.sandboxes_terminated(), 1);

        let third = manager
            .get_or_create_sandbox("s1", &sandbox, None)
            .await
            .unwrap();
        assert_ne!(first.sandbox_id, third.sandbox_id);
    }

    #[tokio::test]
    async fn test_cancelled_creation_is_still_released() {
        let (provider, manager) = manager_with(
            InMemorySandboxProvider::new().with_latency(Duration::from_millis(50)),
            SandboxConfig::default(),
        );
        manager.ensure_snapshot().await.unwrap();
        let sandbox = SandboxRef::new();

        let caller = {
            let manager = Arc::clone(&manager);
            let sandbox = sandbox.clone();
            tokio::spawn(async move { manager.get_or_create_sandbox("s1", &sandbox, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        manager.release_sandbox(&sandbox).await;

        assert!(!sandbox.is_populated().await);
        assert_eq!(provider.sandboxes_created(), 1);
        assert_eq!(provider.sandboxes_terminated(), 1);
        assert_eq!(provider.live_sandboxes(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_sandbox() {
        let (provider, manager) = manager_with(
            InMemorySandboxProvider::new().with_latency(Duration::from_millis(20)),
            SandboxConfig::default(),
        );
        let sandbox = SandboxRef::new();

        let calls = (0..8).map(|_| {
            let manager = Arc::clone(&manager);
            let sandbox = sandbox.clone();
            tokio::spawn(async move { manager.get_or_create_sandbox("s1", &sandbox, None).await })
        });
        let handles: Vec<SandboxHandle> = futures_util::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert!(handles.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(provider.sandboxes_created(), 1);
    }

    #[tokio::test]
    async fn test_secrets_scoped_to_hosts() {
        let mut dependencies = deps(&["openai", "numpy"]);
        dependencies[0].secret_env = Some("OPENAI_API_KEY".into());
        dependencies[0].allowed_hosts = vec!["api.openai.com".into()];

        let (provider, manager) = manager_with(
            InMemorySandboxProvider::new(),
            SandboxConfig {
                dependencies,
                ..Default::default()
            },
        );

        let handle = manager
            .get_or_create_sandbox("s1", &SandboxRef::new(), None)
            .await
            .unwrap();
        let request = provider.sandbox_request(&handle.sandbox_id).unwrap();

        assert_eq!(
            request.secrets,
            vec![SecretSpec {
                env_name: "OPENAI_API_KEY".into(),
                allowed_hosts: vec!["api.openai.com".into()],
            }]
        );
    }

    #[rstest]
    #[case(SandboxScope::Session, true)]
    #[case(SandboxScope::User, false)]
    #[tokio::test]
    async fn test_provision_volume_by_scope(#[case] scope: SandboxScope, #[case] expect: bool) {
        let (provider, manager) = manager_with(
            InMemorySandboxProvider::new(),
            SandboxConfig {
                scope,
                ..Default::default()
            },
        );
        let sandbox = SandboxRef::new();

        let handle = manager.provision("s1", &sandbox).await.unwrap();
        manager.release_sandbox(&sandbox).await;
        manager.provision("s1", &sandbox).await.unwrap();

        let request = provider.sandbox_request(&handle.sandbox_id).unwrap();
        assert_eq!(request.volume.is_some(), expect);
        assert_eq!(provider.volumes_created(), u64::from(expect));
        assert_eq!(manager.volume_exists("s1").await.unwrap(), expect);
    }

    #[tokio::test]
    async fn test_lazy_warm_start_is_noop() {
        let (provider, manager) = manager_with(
            InMemorySandboxProvider::new(),
            SandboxConfig {
                init_mode: SandboxInitMode::Lazy,
                ..Default::default()
            },
        );
        let sandbox = SandboxRef::new();

        assert!(manager.warm_start("s1", &sandbox).await.unwrap().is_none());
        assert_eq!(provider.sandboxes_created(), 0);

        let lease = manager.lease("s1", &sandbox);
        let out = lease.exec("1 + 1").await.unwrap();
        assert_eq!(out.stdout, "1 + 1");
        assert!(lease.is_provisioned().await);
    }

    #[tokio::test]
    async fn test_exec_surfaces_provision_failure() {
        let (provider, manager) =
            manager_with(InMemorySandboxProvider::new(), SandboxConfig::default());
        provider.set_fail_sandboxes(true);

        let err = manager
            .exec("s1", &SandboxRef::new(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxFailure::Provision(_)));
    }
}
