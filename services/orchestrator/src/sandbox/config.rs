//! Sandbox configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When sandboxes are provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxInitMode {
    /// Only on first real use.
    Lazy,
    /// Warm-started in the background as soon as a session actor exists.
    Eager,
}

/// What a persistent volume is tied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxScope {
    /// One volume per session, created on first provisioning.
    Session,
    /// Volumes are managed per user outside the orchestrator.
    User,
}

impl FromStr for SandboxInitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lazy" => Ok(Self::Lazy),
            "eager" => Ok(Self::Eager),
            other => Err(format!("unknown sandbox init mode: {other}")),
        }
    }
}

impl FromStr for SandboxScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "user" => Ok(Self::User),
            other => Err(format!("unknown sandbox scope: {other}")),
        }
    }
}

impl fmt::Display for SandboxInitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lazy => write!(f, "lazy"),
            Self::Eager => write!(f, "eager"),
        }
    }
}

/// A package installed into the sandbox snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxDependency {
    /// Package name. Only this field feeds the snapshot hash.
    pub package: String,

    /// Documentation references surfaced to generation.
    #[serde(default)]
    pub docs: Vec<String>,

    /// Environment variable the package reads its credential from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_env: Option<String>,

    /// Hosts the secret may be sent to.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl SandboxDependency {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            docs: Vec::new(),
            secret_env: None,
            allowed_hosts: Vec::new(),
        }
    }
}

/// Sandbox pool configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Provider identifier (`memory` is built in).
    pub provider: String,
    pub init_mode: SandboxInitMode,
    pub scope: SandboxScope,
    pub region: String,
    /// Snapshot and volume capacity in GiB.
    pub capacity_gb: u32,
    /// Sandbox lifetime limit.
    pub timeout: Duration,
    pub memory_mb: u32,
    pub dependencies: Vec<SandboxDependency>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider: "memory".to_string(),
            init_mode: SandboxInitMode::Eager,
            scope: SandboxScope::Session,
            region: "us-east-1".to_string(),
            capacity_gb: 10,
            timeout: Duration::from_secs(300),
            memory_mb: 1024,
            dependencies: Vec::new(),
        }
    }
}
