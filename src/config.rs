//! Configuration loader and validator for the pack sync service.
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub sync: SyncPolicy,
    pub remote: Remote,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
}

/// Refresh policy for purchased packs and trial state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncPolicy {
    pub rate_limit_minutes: u64,
    pub trial_sync_interval_minutes: u64,
    /// Length of a trial started on this device.
    pub trial_length_days: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            rate_limit_minutes: 30,
            trial_sync_interval_minutes: 60,
            trial_length_days: 3650,
        }
    }
}

/// Upper bounds keeping every interval well inside `chrono::Duration`.
const MAX_INTERVAL_MINUTES: u64 = 525_600;
const MAX_TRIAL_LENGTH_DAYS: u64 = 36_500;

/// Remote document service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub token: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        format!(
            "sqlite://{}/smartexam.db",
            self.app.data_dir.trim_end_matches('/')
        )
    }

    /// Question images are saved under `<data_dir>/assets/`.
    pub fn media_root(&self) -> PathBuf {
        PathBuf::from(&self.app.data_dir)
    }

    // The casts below are lossless for any config that passed `validate`.
    pub fn rate_limit_window(&self) -> Duration {
        Duration::minutes(self.sync.rate_limit_minutes as i64)
    }

    pub fn trial_sync_interval(&self) -> Duration {
        Duration::minutes(self.sync.trial_sync_interval_minutes as i64)
    }

    pub fn trial_length(&self) -> Duration {
        Duration::days(self.sync.trial_length_days as i64)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.sync.rate_limit_minutes == 0 {
        return Err(ConfigError::Invalid("sync.rate_limit_minutes must be > 0"));
    }
    if cfg.sync.trial_sync_interval_minutes == 0 {
        return Err(ConfigError::Invalid(
            "sync.trial_sync_interval_minutes must be > 0",
        ));
    }
    if cfg.sync.rate_limit_minutes > MAX_INTERVAL_MINUTES {
        return Err(ConfigError::Invalid(
            "sync.rate_limit_minutes must be at most 525600 (one year)",
        ));
    }
    if cfg.sync.trial_sync_interval_minutes > MAX_INTERVAL_MINUTES {
        return Err(ConfigError::Invalid(
            "sync.trial_sync_interval_minutes must be at most 525600 (one year)",
        ));
    }
    if cfg.sync.trial_length_days == 0 || cfg.sync.trial_length_days > MAX_TRIAL_LENGTH_DAYS {
        return Err(ConfigError::Invalid(
            "sync.trial_length_days must be between 1 and 36500",
        ));
    }
    if cfg.remote.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.remote.base_url).is_err() {
        return Err(ConfigError::Invalid("remote.base_url must be an absolute URL"));
    }
    if cfg.remote.token.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.token must be non-empty"));
    }
    Ok(())
}

/// Example configuration shipped with the binary.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500

sync:
  rate_limit_minutes: 30
  trial_sync_interval_minutes: 60
  trial_length_days: 3650

remote:
  base_url: "https://documents.example.com/"
  token: "YOUR_API_TOKEN"
"#
}
