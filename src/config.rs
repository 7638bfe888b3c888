//! Configuration loader and validator for the notification processor.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
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
    pub mail: Mail,
    pub delivery: Delivery,
    pub eligibility: Eligibility,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub tick_interval_ms: u64,
    pub sweep_interval_ms: u64,
}

/// Mail API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub api_base: String,
    pub token: String,
    pub from_address: String,
    pub timeout_seconds: u64,
}

/// Retry and backoff policy for delivery attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub max_attempts: u32,
    pub base_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    pub rate_limit_floor_seconds: u64,
}

/// Thresholds deciding when a notification is due. These are business
/// knobs, not constants; operators tune them per deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Eligibility {
    pub global_threshold: usize,
    pub recipient_threshold: usize,
    pub max_batch_size: usize,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
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
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.tick_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.tick_interval_ms must be > 0"));
    }
    if cfg.app.sweep_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.sweep_interval_ms must be > 0"));
    }

    if cfg.mail.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.api_base must be non-empty"));
    }
    if cfg.mail.token.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.token must be non-empty"));
    }
    if cfg.mail.from_address.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.from_address must be non-empty"));
    }
    if cfg.mail.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("mail.timeout_seconds must be > 0"));
    }

    if cfg.delivery.max_attempts == 0 {
        return Err(ConfigError::Invalid("delivery.max_attempts must be >= 1"));
    }
    if cfg.delivery.max_backoff_seconds < cfg.delivery.base_backoff_seconds {
        return Err(ConfigError::Invalid(
            "delivery.max_backoff_seconds must be >= delivery.base_backoff_seconds",
        ));
    }

    if cfg.eligibility.global_threshold == 0 {
        return Err(ConfigError::Invalid(
            "eligibility.global_threshold must be >= 1",
        ));
    }
    if cfg.eligibility.recipient_threshold == 0 {
        return Err(ConfigError::Invalid(
            "eligibility.recipient_threshold must be >= 1",
        ));
    }
    if cfg.eligibility.max_batch_size == 0 {
        return Err(ConfigError::Invalid(
            "eligibility.max_batch_size must be >= 1",
        ));
    }

    Ok(())
}

/// Returns the reference example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  tick_interval_ms: 5000
  sweep_interval_ms: 60000

mail:
  api_base: "https://api.mailrelay.example/"
  token: "YOUR_MAIL_API_TOKEN"
  from_address: "jobs@board.example"
  timeout_seconds: 5

delivery:
  max_attempts: 3
  base_backoff_seconds: 5
  max_backoff_seconds: 3600
  rate_limit_floor_seconds: 60

eligibility:
  global_threshold: 1
  recipient_threshold: 1
  max_batch_size: 50
"#
}
