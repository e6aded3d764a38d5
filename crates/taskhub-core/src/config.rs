//! TaskHub configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DispatchError, Result};

/// Root configuration (`~/.taskhub/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskHubConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl TaskHubConfig {
    /// Load config from the default path, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DispatchError::Config(format!("Failed to parse config: {e}")))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DispatchError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        tracing::info!("💾 Config saved to {}", path.display());
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TaskHub home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskhub")
    }
}

/// Task queue and public store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Seconds between background sweeps of expired store entries.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_cleanup_interval() -> u64 { 60 }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl BrokerConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between ticks.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// How far a schedule whose next fire time could not be computed is pushed back.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// SQLite database holding schedule definitions and the task ledger.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Re-push ledger records still `pending` when the scheduler starts.
    #[serde(default)]
    pub recover_pending_tasks: bool,
    /// Days to keep completed and failed ledger records. 0 keeps them forever.
    #[serde(default = "default_record_retention")]
    pub record_retention_days: u64,
}

fn default_check_interval() -> u64 { 10 }
fn default_error_backoff() -> u64 { 60 }
fn default_db_path() -> String { "~/.taskhub/scheduler.db".into() }
fn default_record_retention() -> u64 { 7 }

/// Upper bound for `error_backoff_secs` (one week).
pub const MAX_ERROR_BACKOFF_SECS: u64 = 7 * 24 * 3600;
/// Upper bound for `record_retention_days` (ten years).
pub const MAX_RECORD_RETENTION_DAYS: u64 = 3650;

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            error_backoff_secs: default_error_backoff(),
            db_path: default_db_path(),
            recover_pending_tasks: false,
            record_retention_days: default_record_retention(),
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    /// Clamped to `1..=MAX_ERROR_BACKOFF_SECS`.
    pub fn error_backoff(&self) -> chrono::Duration {
        let secs = self.error_backoff_secs.clamp(1, MAX_ERROR_BACKOFF_SECS);
        chrono::Duration::try_seconds(secs as i64)
            .unwrap_or_else(|| chrono::Duration::seconds(MAX_ERROR_BACKOFF_SECS as i64))
    }

    /// How long finished ledger records are kept, or `None` to keep them.
    pub fn record_retention(&self) -> Option<chrono::Duration> {
        match self.record_retention_days {
            0 => None,
            days => chrono::Duration::try_days(days.min(MAX_RECORD_RETENTION_DAYS) as i64),
        }
    }

    /// Database path with `~` and env vars expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::full(&self.db_path)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| self.db_path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TaskHubConfig::default();
        assert_eq!(config.broker.cleanup_interval_secs, 60);
        assert_eq!(config.scheduler.check_interval_secs, 10);
        assert_eq!(config.scheduler.error_backoff_secs, 60);
        assert!(!config.scheduler.recover_pending_tasks);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [broker]
            cleanup_interval_secs = 5

            [scheduler]
            check_interval_secs = 1
            db_path = "/var/lib/taskhub/sched.db"
            recover_pending_tasks = true
        "#;

        let config: TaskHubConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.broker.cleanup_interval_secs, 5);
        assert_eq!(config.scheduler.check_interval_secs, 1);
        assert_eq!(config.scheduler.error_backoff_secs, 60);
        assert_eq!(
            config.scheduler.resolved_db_path(),
            PathBuf::from("/var/lib/taskhub/sched.db")
        );
        assert!(config.scheduler.recover_pending_tasks);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: TaskHubConfig = toml::from_str("").unwrap();
        assert_eq!(config.broker.cleanup_interval_secs, 60);
        assert_eq!(config.scheduler.db_path, "~/.taskhub/scheduler.db");
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = SchedulerConfig {
            check_interval_secs: 0,
            error_backoff_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.check_interval(), Duration::from_secs(1));
        assert_eq!(config.error_backoff(), chrono::Duration::seconds(1));
    }

    #[test]
    fn test_huge_backoff_is_capped() {
        let config = SchedulerConfig {
            error_backoff_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(
            config.error_backoff(),
            chrono::Duration::seconds(MAX_ERROR_BACKOFF_SECS as i64)
        );

        let config = SchedulerConfig {
            error_backoff_secs: i64::MAX as u64 / 1000 + 1,
            ..Default::default()
        };
        assert_eq!(
            config.error_backoff(),
            chrono::Duration::seconds(MAX_ERROR_BACKOFF_SECS as i64)
        );
    }

    #[test]
    fn test_record_retention() {
        let mut config = SchedulerConfig::default();
        assert_eq!(config.record_retention(), Some(chrono::Duration::days(7)));
        config.record_retention_days = 0;
        assert_eq!(config.record_retention(), None);
        config.record_retention_days = u64::MAX;
        assert_eq!(
            config.record_retention(),
            Some(chrono::Duration::days(MAX_RECORD_RETENTION_DAYS as i64))
        );
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = TaskHubConfig::default();
        config.scheduler.check_interval_secs = 3;
        config.save_to(&path).unwrap();

        let loaded = TaskHubConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.check_interval_secs, 3);
    }

    #[test]
    fn test_load_from_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scheduler\ncheck_interval_secs = ").unwrap();
        let err = TaskHubConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn test_home_dir() {
        let home = TaskHubConfig::home_dir();
        assert!(home.to_string_lossy().contains("taskhub"));
    }
}
