use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use crate::job::PollPolicy;
use crate::playback::TickPolicy;

pub const API_KEY_ENV: &str = "PLAYHT_API_KEY";
pub const USER_ID_ENV: &str = "PLAYHT_USER_ID";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub playht: PlayHtConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Credentials and endpoint of the conversion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayHtConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_rate")]
    pub default_rate: f64,
    /// Step of the skip back / skip forward controls.
    #[serde(default = "default_skip_secs")]
    pub skip_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where "save audio" puts finished narrations.
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
}

impl Default for PlayHtConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            user_id: String::new(),
            base_url: default_base_url(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            timeout_secs: default_poll_timeout_secs(),
            retry_budget: default_retry_budget(),
            backoff_ms: default_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            default_rate: default_rate(),
            skip_secs: default_skip_secs(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.play.ai/api/v1".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_timeout_secs() -> u64 {
    10
}

fn default_retry_budget() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_tick_ms() -> u64 {
    500
}

fn default_rate() -> f64 {
    1.0
}

fn default_skip_secs() -> f64 {
    15.0
}

fn default_downloads_dir() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl PlayHtConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.user_id.trim().is_empty()
    }
}

impl PollingConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            poll_interval: Duration::from_secs(self.interval_secs),
            poll_timeout: Duration::from_secs(self.timeout_secs.max(1)),
            retry_budget: self.retry_budget.max(1),
            retry_backoff: Duration::from_millis(self.backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

impl PlaybackConfig {
    pub fn tick_policy(&self) -> TickPolicy {
        TickPolicy {
            interval: Duration::from_millis(self.tick_ms.max(10)),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config.with_env_overrides());
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config.with_env_overrides())
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Non-empty `PLAYHT_API_KEY` / `PLAYHT_USER_ID` win over the file.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(API_KEY_ENV).ok(),
            std::env::var(USER_ID_ENV).ok(),
        )
    }

    fn with_overrides(mut self, api_key: Option<String>, user_id: Option<String>) -> Self {
        if let Some(key) = api_key.filter(|v| !v.trim().is_empty()) {
            self.playht.api_key = key.trim().to_string();
        }
        if let Some(user) = user_id.filter(|v| !v.trim().is_empty()) {
            self.playht.user_id = user.trim().to_string();
        }
        self
    }
}
