//! Configuration loader and validator for the console sync engine.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
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
    pub backend: Backend,
    pub polling: Polling,
    pub feed: Feed,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Action-log entries authored by this user are not surfaced.
    #[serde(default)]
    pub current_user_id: Option<i64>,
}

/// Console backend connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backend {
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Poll cadences, one per source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Polling {
    pub requests_interval_ms: u64,
    pub messages_interval_ms: u64,
    pub action_log_interval_ms: u64,
    pub status_fast_interval_ms: u64,
    pub status_idle_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Notification feed bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feed {
    pub capacity: usize,
    pub max_dedup_keys: usize,
}

fn default_request_timeout_ms() -> u64 {
    10_000
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
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/console-sync.db?mode=rwc",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }
}

impl Polling {
    pub fn requests_interval(&self) -> Duration {
        Duration::from_millis(self.requests_interval_ms)
    }

    pub fn messages_interval(&self) -> Duration {
        Duration::from_millis(self.messages_interval_ms)
    }

    pub fn action_log_interval(&self) -> Duration {
        Duration::from_millis(self.action_log_interval_ms)
    }

    pub fn status_fast_interval(&self) -> Duration {
        Duration::from_millis(self.status_fast_interval_ms)
    }

    pub fn status_idle_interval(&self) -> Duration {
        Duration::from_millis(self.status_idle_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
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

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if Url::parse(&cfg.backend.base_url).is_err() {
        return Err(ConfigError::Invalid("backend.base_url must be a valid URL"));
    }
    if cfg.backend.token.trim().is_empty() {
        return Err(ConfigError::Invalid("backend.token must be non-empty"));
    }
    if cfg.backend.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid("backend.request_timeout_ms must be > 0"));
    }

    let p = &cfg.polling;
    if p.requests_interval_ms == 0 {
        return Err(ConfigError::Invalid("polling.requests_interval_ms must be > 0"));
    }
    if p.messages_interval_ms == 0 {
        return Err(ConfigError::Invalid("polling.messages_interval_ms must be > 0"));
    }
    if p.action_log_interval_ms == 0 {
        return Err(ConfigError::Invalid("polling.action_log_interval_ms must be > 0"));
    }
    if p.status_fast_interval_ms == 0 {
        return Err(ConfigError::Invalid("polling.status_fast_interval_ms must be > 0"));
    }
    if p.status_fast_interval_ms >= p.status_idle_interval_ms {
        return Err(ConfigError::Invalid(
            "polling.status_fast_interval_ms must be < polling.status_idle_interval_ms",
        ));
    }

    if cfg.feed.capacity == 0 {
        return Err(ConfigError::Invalid("feed.capacity must be > 0"));
    }
    if cfg.feed.max_dedup_keys < cfg.feed.capacity {
        return Err(ConfigError::Invalid("feed.max_dedup_keys must be >= feed.capacity"));
    }

    Ok(())
}

/// Returns the example YAML document shipped with the binary.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  current_user_id: 42

backend:
  base_url: "http://localhost:8080/"
  token: "YOUR_CONSOLE_API_TOKEN"
  request_timeout_ms: 10000

polling:
  requests_interval_ms: 10000
  messages_interval_ms: 10000
  action_log_interval_ms: 15000
  status_fast_interval_ms: 3000
  status_idle_interval_ms: 30000
  max_backoff_seconds: 60

feed:
  capacity: 10
  max_dedup_keys: 5000
"#
}
