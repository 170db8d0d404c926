//! Configuration loader and validator for the campaign dispatcher.
use crate::model::CampaignConfiguration;
use chrono::{DateTime, Timelike, Utc};
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

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    #[serde(default)]
    pub dispatch: Dispatch,
    #[serde(default)]
    pub variations: Variations,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    #[serde(default = "default_signal_retention")]
    pub signal_retention_seconds: u64,
}

fn default_signal_retention() -> u64 {
    24 * 3600
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Operators allowed to issue control commands. Empty means nobody.
    #[serde(default)]
    pub allowed_users: Vec<i64>,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_seconds: u64,
}

fn default_send_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Dispatch {
    pub campaign: CampaignConfiguration,
    pub business_hours: BusinessHours,
    pub max_signal_failures: u32,
    pub handoff_timeout_seconds: u64,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            campaign: CampaignConfiguration::default(),
            business_hours: BusinessHours::default(),
            max_signal_failures: 3,
            handoff_timeout_seconds: 30,
        }
    }
}

/// Daily sending window, `[start_hour, end_hour)` in the given UTC offset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub utc_offset_minutes: i32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 8,
            end_hour: 20,
            utc_offset_minutes: 0,
        }
    }
}

impl BusinessHours {
    fn seconds_into_day(&self, now: DateTime<Utc>) -> i64 {
        let utc = now.num_seconds_from_midnight() as i64;
        (utc + self.utc_offset_minutes as i64 * 60).rem_euclid(86_400)
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let secs = self.seconds_into_day(now);
        secs >= self.start_hour as i64 * 3600 && secs < self.end_hour as i64 * 3600
    }

    /// Time until the window next opens. Zero while it is open.
    pub fn until_open(&self, now: DateTime<Utc>) -> Duration {
        if self.contains(now) {
            return Duration::ZERO;
        }
        let secs = self.seconds_into_day(now);
        let open = self.start_hour as i64 * 3600;
        let wait = if secs < open {
            open - secs
        } else {
            86_400 - secs + open
        };
        Duration::from_secs(wait as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Variations {
    /// Generation endpoint. When unset only the local generator is used.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub count: usize,
    /// Selection probability of the original text.
    pub original_weight: f64,
}

impl Default for Variations {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_seconds: 20,
            max_retries: 2,
            count: 4,
            original_weight: 0.25,
        }
    }
}

impl App {
    pub fn resolved_data_dir(&self) -> String {
        match (self.data_dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => self.data_dir.clone(),
        }
    }
}

impl Config {
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` wins over the file under `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/campaigns.db", self.app.resolved_data_dir())
        })
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.telegram.send_timeout_seconds)
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
///
/// An empty `telegram.bot_token` is accepted here: the sender reports it as
/// missing credentials when a campaign is started, so read-only commands
/// still work without one.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.telegram.send_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "telegram.send_timeout_seconds must be > 0",
        ));
    }

    validate_campaign(&cfg.dispatch.campaign)?;

    let hours = &cfg.dispatch.business_hours;
    if hours.start_hour > 23 || hours.end_hour > 24 || hours.start_hour >= hours.end_hour {
        return Err(ConfigError::Invalid(
            "dispatch.business_hours must satisfy 0 <= start_hour < end_hour <= 24",
        ));
    }
    if hours.utc_offset_minutes.abs() >= 24 * 60 {
        return Err(ConfigError::Invalid(
            "dispatch.business_hours.utc_offset_minutes out of range",
        ));
    }

    let v = &cfg.variations;
    if !(v.original_weight > 0.0 && v.original_weight <= 1.0) {
        return Err(ConfigError::Invalid(
            "variations.original_weight must be in (0, 1]",
        ));
    }
    if v.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("variations.timeout_seconds must be > 0"));
    }
    if let Some(endpoint) = &v.endpoint {
        if endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "variations.endpoint must be non-empty when set",
            ));
        }
    }

    Ok(())
}

/// Upper bound for every per-campaign delay, in seconds.
pub const MAX_DELAY_SECONDS: u64 = 86_400;

pub fn validate_campaign(c: &CampaignConfiguration) -> Result<(), ConfigError> {
    if c.batch_size == 0 {
        return Err(ConfigError::Invalid("campaign batch_size must be > 0"));
    }
    if c.delay_between_sends > MAX_DELAY_SECONDS {
        return Err(ConfigError::Invalid(
            "campaign delay_between_sends must be at most one day",
        ));
    }
    if c.delay_jitter > MAX_DELAY_SECONDS {
        return Err(ConfigError::Invalid("campaign delay_jitter must be at most one day"));
    }
    if c.batch_delay > MAX_DELAY_SECONDS {
        return Err(ConfigError::Invalid("campaign batch_delay must be at most one day"));
    }
    if c.max_retries == 0 {
        return Err(ConfigError::Invalid("campaign max_retries must be > 0"));
    }
    Ok(())
}

/// Returns the canonical example YAML.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 1000
  signal_retention_seconds: 86400

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  allowed_users:
    - 123456789
  send_timeout_seconds: 30

dispatch:
  campaign:
    delay_between_sends: 5
    delay_jitter: 10
    batch_size: 20
    batch_delay: 60
    max_retries: 3
    business_hours_only: false
  business_hours:
    start_hour: 8
    end_hour: 20
    utc_offset_minutes: 0
  max_signal_failures: 3
  handoff_timeout_seconds: 30

variations:
  endpoint: "https://paraphrase.example/v1/variations"
  api_key: "YOUR_PARAPHRASE_API_KEY"
  timeout_seconds: 20
  max_retries: 2
  count: 4
  original_weight: 0.25
"#
}
