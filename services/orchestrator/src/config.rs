use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::actors::RegistryConfig;
use crate::event_log::EventLogConfig;
use crate::jobs::{CleanupConfig, DormancyConfig};
use crate::sandbox::{SandboxConfig, SandboxDependency};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub event_log: EventLogConfig,
    pub registry: RegistryConfig,
    pub dormancy: DormancyConfig,
    pub cleanup: CleanupConfig,
    pub sandbox: SandboxConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let log_level = env.string("WEFT_LOG_LEVEL", "info");

        let event_log_defaults = EventLogConfig::default();
        let event_log = EventLogConfig {
            database_url: env.string("WEFT_DATABASE_URL", &event_log_defaults.database_url),
            max_connections: env.parse(
                "WEFT_DB_MAX_CONNECTIONS",
                event_log_defaults.max_connections,
            )?,
            acquire_timeout: event_log_defaults.acquire_timeout,
            retention: env.secs("WEFT_EVENT_RETENTION_SECS", event_log_defaults.retention)?,
        };

        let registry_defaults = RegistryConfig::default();
        let registry = RegistryConfig {
            max_batch_actions: env.parse(
                "WEFT_MAX_BATCH_ACTIONS",
                registry_defaults.max_batch_actions,
            )?,
            event_channel_capacity: env.parse(
                "WEFT_EVENT_CHANNEL_CAPACITY",
                registry_defaults.event_channel_capacity,
            )?,
            generation_attempts: env.parse(
                "WEFT_GENERATION_ATTEMPTS",
                registry_defaults.generation_attempts,
            )?,
        };

        let dormancy_defaults = DormancyConfig::default();
        let dormancy = DormancyConfig {
            interval: env.secs("WEFT_DORMANCY_INTERVAL_SECS", dormancy_defaults.interval)?,
            timeout: env.secs("WEFT_DORMANCY_TIMEOUT_SECS", dormancy_defaults.timeout)?,
        };

        let cleanup = CleanupConfig {
            interval: env.secs("WEFT_CLEANUP_INTERVAL_SECS", CleanupConfig::default().interval)?,
        };

        let sandbox_defaults = SandboxConfig::default();
        let dependencies = match env.get("WEFT_SANDBOX_DEPENDENCIES") {
            Some(raw) => serde_json::from_str::<Vec<SandboxDependency>>(&raw)
                .context("WEFT_SANDBOX_DEPENDENCIES must be a JSON array of dependencies")?,
            None => sandbox_defaults.dependencies,
        };
        let sandbox = SandboxConfig {
            provider: env.string("WEFT_SANDBOX_PROVIDER", &sandbox_defaults.provider),
            init_mode: env.parse("WEFT_SANDBOX_INIT", sandbox_defaults.init_mode)?,
            scope: env.parse("WEFT_SANDBOX_SCOPE", sandbox_defaults.scope)?,
            region: env.string("WEFT_SANDBOX_REGION", &sandbox_defaults.region),
            capacity_gb: env.parse("WEFT_SANDBOX_CAPACITY_GB", sandbox_defaults.capacity_gb)?,
            timeout: env.secs("WEFT_SANDBOX_TIMEOUT_SECS", sandbox_defaults.timeout)?,
            memory_mb: env.parse("WEFT_SANDBOX_MEMORY_MB", sandbox_defaults.memory_mb)?,
            dependencies,
        };

        Ok(Self {
            log_level,
            event_log,
            registry,
            dormancy,
            cleanup,
            sandbox,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| anyhow!("invalid {key}={raw}: {e}")),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }
}
