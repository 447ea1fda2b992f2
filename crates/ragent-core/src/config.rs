use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5 * 60;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_MAX_EXECUTION_HISTORY: usize = 100;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_SCRIPT_MAX_OUTPUT_CHARS: usize = 30_000;

/// Top-level config (ragent.toml + RAGENT_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagentConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executors: ExecutorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Knobs for the dispatcher and its housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global cap on concurrently executing runs.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Off by default: a failed run waits for its next scheduled fire.
    #[serde(default)]
    pub retry_enabled: bool,
    /// Total attempts per fire when `retry_enabled` is set.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Most-recent runs kept per task by the cleanup pass. 0 keeps everything.
    #[serde(default = "default_max_execution_history")]
    pub max_execution_history: usize,
    /// Runs older than this are pruned. 0 disables age-based pruning.
    #[serde(default)]
    pub history_max_age_days: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How long `stop` waits for in-flight runs before abandoning them.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            retry_enabled: false,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            max_execution_history: DEFAULT_MAX_EXECUTION_HISTORY,
            history_max_age_days: 0,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn history_max_age(&self) -> Duration {
        Duration::from_secs(self.history_max_age_days * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    #[serde(default)]
    pub script: ScriptConfig,
}

/// Defaults for the `script` executor; each task may override shell and timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Shell binary. `None` picks the platform shell (`sh`, or `cmd` on Windows).
    pub shell: Option<String>,
    #[serde(default = "default_script_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_script_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            shell: None,
            timeout_secs: DEFAULT_SCRIPT_TIMEOUT_SECS,
            max_output_chars: DEFAULT_SCRIPT_MAX_OUTPUT_CHARS,
        }
    }
}

fn default_max_concurrent_tasks() -> usize {
    DEFAULT_MAX_CONCURRENT_TASKS
}
fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}
fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}
fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}
fn default_max_execution_history() -> usize {
    DEFAULT_MAX_EXECUTION_HISTORY
}
fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}
fn default_script_timeout_secs() -> u64 {
    DEFAULT_SCRIPT_TIMEOUT_SECS
}
fn default_script_max_output_chars() -> usize {
    DEFAULT_SCRIPT_MAX_OUTPUT_CHARS
}

/// `<user config dir>/ragent`, falling back to `./.ragent` when the platform
/// reports no config directory.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("ragent"))
        .unwrap_or_else(|| PathBuf::from(".ragent"))
}

fn default_db_path() -> String {
    config_dir().join("scheduler.db").to_string_lossy().into_owned()
}

fn default_config_path() -> PathBuf {
    config_dir().join("ragent.toml")
}

impl RagentConfig {
    /// Load config from a TOML file with RAGENT_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `RAGENT_SCHEDULER__MAX_CONCURRENT_TASKS=8`. A missing file is not an
    /// error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);

        tracing::debug!(path = %path.display(), "loading configuration");

        let config: RagentConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RAGENT_").split("__"))
            .extract()
            .map_err(|e| crate::error::RagentError::Config(e.to_string()))?;

        Ok(config)
    }
}
