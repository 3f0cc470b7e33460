use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub database_path: PathBuf,
    pub workflows_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub overrides: OverrideSettings,
    #[serde(default)]
    pub tracing: TracingSettings,
    #[serde(default)]
    pub pollers: PollerSettings,
    #[serde(default)]
    pub reminders: ReminderSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OverrideSettings {
    #[serde(default = "default_override_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_shared_credential_env")]
    pub shared_credential_env: String,
}

impl Default for OverrideSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_override_ttl_secs(),
            shared_credential_env: default_shared_credential_env(),
        }
    }
}

impl OverrideSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Shared credential used for every override capability, if present in the environment.
    pub fn shared_credential(&self) -> Option<String> {
        std::env::var(&self.shared_credential_env)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TracingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_snapshot_max_bytes")]
    pub snapshot_max_bytes: usize,
    #[serde(default = "default_snapshot_repr_chars")]
    pub snapshot_repr_chars: usize,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            snapshot_max_bytes: default_snapshot_max_bytes(),
            snapshot_repr_chars: default_snapshot_repr_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PollerSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_draft_unit")]
    pub draft_unit: String,
    #[serde(default = "default_plan_unit")]
    pub plan_unit: String,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            execution_timeout_secs: default_execution_timeout_secs(),
            draft_unit: default_draft_unit(),
            plan_unit: default_plan_unit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReminderSettings {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_max_escalations")]
    pub max_escalations: u32,
    #[serde(default = "default_auto_snooze_days")]
    pub auto_snooze_days: i64,
    #[serde(default = "default_spacing_days")]
    pub default_spacing_days: i64,
    #[serde(default = "default_send_pause_ms")]
    pub send_pause_ms: u64,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            max_escalations: default_max_escalations(),
            auto_snooze_days: default_auto_snooze_days(),
            default_spacing_days: default_spacing_days(),
            send_pause_ms: default_send_pause_ms(),
        }
    }
}

/// Transient-failure retry applied to every capability call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delays_ms")]
    pub delays_ms: Vec<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            delays_ms: default_retry_delays_ms(),
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "`database_path` must be non-empty".to_string(),
            ));
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`log_level` must be non-empty".to_string(),
            ));
        }
        if self.overrides.cache_ttl_secs == 0 {
            return Err(ConfigError::Settings(
                "`overrides.cache_ttl_secs` must be greater than 0".to_string(),
            ));
        }
        if self.tracing.batch_size == 0 {
            return Err(ConfigError::Settings(
                "`tracing.batch_size` must be greater than 0".to_string(),
            ));
        }
        if self.tracing.flush_interval_secs == 0 {
            return Err(ConfigError::Settings(
                "`tracing.flush_interval_secs` must be greater than 0".to_string(),
            ));
        }
        if self.pollers.poll_interval_secs == 0 {
            return Err(ConfigError::Settings(
                "`pollers.poll_interval_secs` must be greater than 0".to_string(),
            ));
        }
        if self.pollers.execution_timeout_secs == 0 {
            return Err(ConfigError::Settings(
                "`pollers.execution_timeout_secs` must be greater than 0".to_string(),
            ));
        }
        if self.reminders.check_interval_secs == 0 {
            return Err(ConfigError::Settings(
                "`reminders.check_interval_secs` must be greater than 0".to_string(),
            ));
        }
        if self.reminders.auto_snooze_days <= 0 || self.reminders.default_spacing_days <= 0 {
            return Err(ConfigError::Settings(
                "`reminders.auto_snooze_days` and `reminders.default_spacing_days` must be positive"
                    .to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Settings(
                "`retry.max_attempts` must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_override_ttl_secs() -> u64 {
    60
}

fn default_shared_credential_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_stop_timeout_secs() -> u64 {
    5
}

fn default_snapshot_max_bytes() -> usize {
    50_000
}

fn default_snapshot_repr_chars() -> usize {
    2_000
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_stale_after_secs() -> u64 {
    120
}

fn default_execution_timeout_secs() -> u64 {
    300
}

fn default_draft_unit() -> String {
    "comment_generator".to_string()
}

fn default_plan_unit() -> String {
    "engagement_planner".to_string()
}

fn default_check_interval_secs() -> u64 {
    15 * 60
}

fn default_max_escalations() -> u32 {
    3
}

fn default_auto_snooze_days() -> i64 {
    7
}

fn default_spacing_days() -> i64 {
    3
}

fn default_send_pause_ms() -> u64 {
    500
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![1_000, 3_000, 8_000]
}
