//! TOML configuration for the flowtest orchestrator.
//!
//! Every section is optional and falls back to compiled-in defaults. The file
//! is picked from `--config`, then `FLOWTEST_CONFIG`, then
//! `/etc/flowtest/flowtest.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "FLOWTEST_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/flowtest/flowtest.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub repositories: RepositoriesConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load from an explicit path, the `FLOWTEST_CONFIG` env var, the system
    /// location, or fall back to defaults, in that order.
    ///
    /// An explicit path that cannot be loaded is an error; the implicit
    /// sources only warn.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FLOWTEST_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.execution.max_concurrency == 0 {
            bail!("execution.max_concurrency must be at least 1");
        }
        if self.execution.test_timeout_secs == 0 {
            bail!("execution.test_timeout_secs must be at least 1");
        }
        if self.scheduler.poll_interval_secs == 0 {
            bail!("scheduler.poll_interval_secs must be at least 1");
        }
        if self.queue.max_attempts == 0 {
            bail!("queue.max_attempts must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; parent directories are created on open.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/flowtest.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Tests a batch runs at once.
    pub max_concurrency: usize,
    /// Wall-clock limit for one test subprocess.
    pub test_timeout_secs: u64,
}

impl ExecutionConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            test_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoriesConfig {
    /// Where checkouts live when a repository has no explicit path.
    pub checkout_root: PathBuf,
    /// Path (or bare command name resolved via `$PATH`) to git.
    pub git_binary: String,
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self {
            checkout_root: PathBuf::from("data/repos"),
            git_binary: "git".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deliveries of one job before it is dropped.
    pub max_attempts: u32,
    /// Base delay between attempts; attempt `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
