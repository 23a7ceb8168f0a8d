use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{flog_debug, Error, Result};

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Linear,
    #[default]
    Exponential,
}

/// Retry delay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

/// Circuit breaker configuration for worker spawning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Backpressure configuration for task admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    #[serde(default = "default_min_concurrent")]
    pub min_concurrent: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            failure_rate_threshold: default_failure_rate_threshold(),
            min_concurrent: default_min_concurrent(),
        }
    }
}

/// How workers are launched: real subprocesses, containers, or the
/// in-process null launcher used for dry runs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LauncherMode {
    #[default]
    Subprocess,
    Container,
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
    /// Context usage (0.0-1.0) past which a worker must checkpoint and hand off.
    #[serde(default = "default_checkpoint_threshold")]
    pub checkpoint_threshold: f64,
    #[serde(default)]
    pub launcher: LauncherMode,
    /// Worker binary used by the subprocess launcher.
    #[serde(default = "default_worker_program")]
    pub worker_program: String,
    /// Shell command run against merged staging before promotion.
    /// No command means the gate always passes.
    pub gate_command: Option<String>,
    #[serde(default = "default_gate_timeout_secs")]
    pub gate_timeout_secs: u64,
    pub worktree_dir: Option<String>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            retry_attempts: default_retry_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            max_revisions: default_max_revisions(),
            checkpoint_threshold: default_checkpoint_threshold(),
            launcher: LauncherMode::default(),
            worker_program: default_worker_program(),
            gate_command: None,
            gate_timeout_secs: default_gate_timeout_secs(),
            worktree_dir: None,
            backoff: BackoffConfig::default(),
            circuit: CircuitConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_stall_timeout_secs() -> u64 {
    300
}
fn default_max_revisions() -> u32 {
    3
}
fn default_checkpoint_threshold() -> f64 {
    0.85
}
fn default_worker_program() -> String {
    "foreman-worker".to_string()
}
fn default_gate_timeout_secs() -> u64 {
    600
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_window() -> usize {
    20
}
fn default_failure_rate_threshold() -> f64 {
    0.5
}
fn default_min_concurrent() -> usize {
    1
}

impl Config {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.toml"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::foreman_dir()?.join("worktrees")),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        flog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        flog_debug!(
            "Config loaded: max_concurrent={}, retry_attempts={}, launcher={:?}",
            config.max_concurrent,
            config.retry_attempts,
            config.launcher
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let foreman_dir = Self::foreman_dir()?;
        if !foreman_dir.exists() {
            fs::create_dir_all(&foreman_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let foreman_dir = Self::foreman_dir()?;
        let worktrees_dir = self.worktrees_dir()?;
        flog_debug!(
            "Config::ensure_dirs foreman={} worktrees={}",
            foreman_dir.display(),
            worktrees_dir.display()
        );
        if !foreman_dir.exists() {
            fs::create_dir_all(&foreman_dir)?;
        }
        if !worktrees_dir.exists() {
            fs::create_dir_all(&worktrees_dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
