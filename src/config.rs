//! Configuration loader and validator for the fragwatch pipeline.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_FETCH_LIMIT: u32 = 5;
pub const MAX_FETCH_LIMIT: u32 = 100;
pub const DEFAULT_MAX_ITEMS: u64 = 500;
pub const DEFAULT_CUTOFF_DAYS: i64 = 14;
pub const MAX_CUTOFF_DAYS: i64 = 36_500;
pub const DEFAULT_PAGE_DELAY_MS: u64 = 2_000;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_PERSIST_RETRY_SECS: u64 = 30;

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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub reddit: Reddit,
    #[serde(default)]
    pub openai: OpenAi,
    pub broker: Broker,
}

/// Pipeline settings. Numeric values are kept raw and read through the
/// accessors, which fall back to defaults on missing or unusable input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_subreddit")]
    pub subreddit: String,
    #[serde(default, deserialize_with = "lenient_number")]
    pub fetch_limit: Option<i64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub backfill_max_items: Option<i64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub backfill_cutoff_days: Option<i64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub page_delay_ms: Option<i64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub shutdown_grace_seconds: Option<i64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub persist_retry_seconds: Option<i64>,
}

/// Reddit script-app credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reddit {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Extraction service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenAi {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for Reddit {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            username: String::new(),
            password: String::new(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for OpenAi {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
        }
    }
}

/// NATS JetStream settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broker {
    pub url: String,
    pub stream: String,
    pub subject: String,
    pub consumer: String,
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
}

fn default_subreddit() -> String {
    "fragranceswap".into()
}

fn default_user_agent() -> String {
    "fragwatch/0.1".into()
}

fn default_model() -> String {
    "gpt-4o-2024-08-06".into()
}

fn default_max_deliver() -> i64 {
    5
}

/// Accept integers, numeric strings, or anything else (which becomes `None`).
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_yaml::Value::Number(n) => n.as_i64(),
        serde_yaml::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

fn positive_or(raw: Option<i64>, default: u64, name: &str) -> u64 {
    match raw {
        Some(v) if v > 0 => v as u64,
        Some(v) => {
            warn!(setting = name, value = v, default, "non-positive setting; using default");
            default
        }
        None => default,
    }
}

impl App {
    /// Page size for source fetches, bounded to 1..=100.
    pub fn fetch_limit(&self) -> u32 {
        match self.fetch_limit {
            Some(v) if (1..=MAX_FETCH_LIMIT as i64).contains(&v) => v as u32,
            Some(v) => {
                warn!(
                    value = v,
                    default = DEFAULT_FETCH_LIMIT,
                    "fetch_limit out of range [1, 100]; using default"
                );
                DEFAULT_FETCH_LIMIT
            }
            None => DEFAULT_FETCH_LIMIT,
        }
    }

    pub fn backfill_max_items(&self) -> u64 {
        positive_or(self.backfill_max_items, DEFAULT_MAX_ITEMS, "backfill_max_items")
    }

    /// Backfill window, bounded to 1..=36500 days.
    pub fn backfill_cutoff(&self) -> ChronoDuration {
        let days = match self.backfill_cutoff_days {
            Some(v) if (1..=MAX_CUTOFF_DAYS).contains(&v) => v,
            Some(v) => {
                warn!(
                    value = v,
                    default = DEFAULT_CUTOFF_DAYS,
                    "backfill_cutoff_days out of range [1, 36500]; using default"
                );
                DEFAULT_CUTOFF_DAYS
            }
            None => DEFAULT_CUTOFF_DAYS,
        };
        ChronoDuration::days(days)
    }

    /// Oldest creation time a backfill starting at `now` will publish.
    pub fn backfill_cutoff_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.backfill_cutoff())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Inter-page politeness delay. Zero is allowed.
    pub fn page_delay(&self) -> Duration {
        match self.page_delay_ms {
            Some(v) if v >= 0 => Duration::from_millis(v as u64),
            Some(v) => {
                warn!(value = v, "negative page_delay_ms; using default");
                Duration::from_millis(DEFAULT_PAGE_DELAY_MS)
            }
            None => Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(positive_or(
            self.shutdown_grace_seconds,
            DEFAULT_SHUTDOWN_GRACE_SECS,
            "shutdown_grace_seconds",
        ))
    }

    pub fn persist_retry_delay(&self) -> Duration {
        Duration::from_secs(positive_or(
            self.persist_retry_seconds,
            DEFAULT_PERSIST_RETRY_SECS,
            "persist_retry_seconds",
        ))
    }

    /// Default SQLite location when `DATABASE_URL` is not set.
    pub fn default_database_url(&self) -> String {
        format!("sqlite://{}/fragwatch.db", self.data_dir.trim_end_matches('/'))
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Overlay secrets and connection strings from the environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Overlay values from `lookup`; empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("NATS_URL") {
            self.broker.url = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.openai.api_key = v;
        }
        if let Some(v) = get("REDDIT_CLIENT_ID") {
            self.reddit.client_id = v;
        }
        if let Some(v) = get("REDDIT_CLIENT_SECRET") {
            self.reddit.client_secret = v;
        }
        if let Some(v) = get("REDDIT_USERNAME") {
            self.reddit.username = v;
        }
        if let Some(v) = get("REDDIT_PASSWORD") {
            self.reddit.password = v;
        }
        if let Some(v) = get("REDDIT_FETCH_LIMIT") {
            match v.trim().parse::<i64>() {
                Ok(n) => self.app.fetch_limit = Some(n),
                Err(err) => {
                    warn!(value = %v, %err, "invalid REDDIT_FETCH_LIMIT; using default");
                    self.app.fetch_limit = None;
                }
            }
        }
    }

    /// Checks the settings needed to build the content source.
    pub fn require_reddit(&self) -> Result<&Reddit, ConfigError> {
        let r = &self.reddit;
        if r.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("reddit.client_id must be non-empty"));
        }
        if r.client_secret.trim().is_empty() {
            return Err(ConfigError::Invalid("reddit.client_secret must be non-empty"));
        }
        if r.username.trim().is_empty() {
            return Err(ConfigError::Invalid("reddit.username must be non-empty"));
        }
        if r.password.trim().is_empty() {
            return Err(ConfigError::Invalid("reddit.password must be non-empty"));
        }
        Ok(r)
    }

    /// Checks the settings needed to build the extractor.
    pub fn require_openai(&self) -> Result<&OpenAi, ConfigError> {
        if self.openai.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("openai.api_key must be non-empty"));
        }
        if self.openai.model.trim().is_empty() {
            return Err(ConfigError::Invalid("openai.model must be non-empty"));
        }
        Ok(&self.openai)
    }
}

/// Load configuration from a YAML file, apply environment overrides and
/// validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.subreddit.trim().is_empty() {
        return Err(ConfigError::Invalid("app.subreddit must be non-empty"));
    }
    if cfg.broker.url.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.url must be non-empty"));
    }
    if cfg.broker.stream.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.stream must be non-empty"));
    }
    if cfg.broker.subject.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.subject must be non-empty"));
    }
    if cfg.broker.consumer.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.consumer must be non-empty"));
    }
    if cfg.broker.max_deliver == 0 {
        return Err(ConfigError::Invalid("broker.max_deliver must be non-zero"));
    }
    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  subreddit: "fragranceswap"
  fetch_limit: 25
  backfill_max_items: 500
  backfill_cutoff_days: 14
  page_delay_ms: 2000
  shutdown_grace_seconds: 30
  persist_retry_seconds: 30

reddit:
  client_id: "YOUR_REDDIT_CLIENT_ID"
  client_secret: "YOUR_REDDIT_CLIENT_SECRET"
  username: "YOUR_REDDIT_USERNAME"
  password: "YOUR_REDDIT_PASSWORD"
  user_agent: "fragwatch/0.1 (by u/YOUR_REDDIT_USERNAME)"

openai:
  api_key: "YOUR_OPENAI_API_KEY"
  model: "gpt-4o-2024-08-06"

broker:
  url: "nats://127.0.0.1:4222"
  stream: "POSTS"
  subject: "posts.new"
  consumer: "post-worker"
  max_deliver: 5
"#
}
